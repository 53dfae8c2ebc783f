use anyhow::{Context, Result};
use arrow::{
    array::{ArrayRef, Float64Builder, Int64Builder, ListBuilder, StringBuilder},
    datatypes::{DataType, Field, Schema},
    record_batch::RecordBatch,
};
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::{
    basic::{Compression, ZstdLevel},
    file::properties::WriterProperties,
};
use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::model::{Record, RecordKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnType {
    Utf8,
    Float64,
    Int64List,
    Utf8List,
}

/// The wide output table. Every record type shares it; columns a type does
/// not define are null.
const COLUMNS: [(&str, ColumnType); 34] = [
    ("uuid", ColumnType::Utf8),
    ("parent_uuid", ColumnType::Utf8),
    ("record_type", ColumnType::Utf8),
    ("reporting_entity_name", ColumnType::Utf8),
    ("reporting_entity_type", ColumnType::Utf8),
    ("last_updated_on", ColumnType::Utf8),
    ("version", ColumnType::Utf8),
    ("plan_market_type", ColumnType::Utf8),
    ("plan_name", ColumnType::Utf8),
    ("plan_id_type", ColumnType::Utf8),
    ("plan_id", ColumnType::Utf8),
    ("provider_group_id", ColumnType::Utf8),
    ("provider_parent", ColumnType::Utf8),
    ("provider_npi_list", ColumnType::Int64List),
    ("provider_tin_type", ColumnType::Utf8),
    ("provider_tin_value", ColumnType::Utf8),
    ("in_name", ColumnType::Utf8),
    ("in_description", ColumnType::Utf8),
    ("in_negotiation_arrangement", ColumnType::Utf8),
    ("in_billing_code_type", ColumnType::Utf8),
    ("in_billing_code", ColumnType::Utf8),
    ("in_billing_code_type_version", ColumnType::Utf8),
    ("in_bc_billing_code_type", ColumnType::Utf8),
    ("in_bc_billing_code", ColumnType::Utf8),
    ("in_bc_billing_code_type_version", ColumnType::Utf8),
    ("in_bc_description", ColumnType::Utf8),
    ("in_np_negotiated_type", ColumnType::Utf8),
    ("in_np_billing_class", ColumnType::Utf8),
    ("in_np_expiration_date", ColumnType::Utf8),
    ("in_np_negotiated_rate", ColumnType::Float64),
    ("in_np_additional_information", ColumnType::Utf8),
    ("in_np_service_codes", ColumnType::Utf8List),
    ("in_np_billing_code_modifiers", ColumnType::Utf8List),
    ("in_nr_provider_references", ColumnType::Utf8List),
];

fn list_item(data_type: DataType) -> DataType {
    DataType::List(Arc::new(Field::new("item", data_type, true)))
}

pub fn mrf_schema() -> Arc<Schema> {
    let fields: Vec<Field> = COLUMNS
        .iter()
        .map(|(name, column_type)| {
            let data_type = match column_type {
                ColumnType::Utf8 => DataType::Utf8,
                ColumnType::Float64 => DataType::Float64,
                ColumnType::Int64List => list_item(DataType::Int64),
                ColumnType::Utf8List => list_item(DataType::Utf8),
            };
            Field::new(*name, data_type, true)
        })
        .collect();
    Arc::new(Schema::new(fields))
}

/// One cell of a row, typed to match its column.
#[derive(Debug, Clone, Copy)]
enum Cell<'a> {
    Utf8(Option<&'a str>),
    Float64(Option<f64>),
    Int64List(Option<&'a [i64]>),
    Utf8List(Option<&'a [String]>),
}

/// A record flattened onto the wide table, borrowing from the record.
#[derive(Debug, Default)]
struct Row<'a> {
    uuid: &'a str,
    parent_uuid: &'a str,
    record_type: &'static str,
    reporting_entity_name: Option<&'a str>,
    reporting_entity_type: Option<&'a str>,
    last_updated_on: Option<&'a str>,
    version: Option<&'a str>,
    plan_market_type: Option<&'a str>,
    plan_name: Option<&'a str>,
    plan_id_type: Option<&'a str>,
    plan_id: Option<&'a str>,
    provider_group_id: Option<&'a str>,
    provider_parent: Option<&'a str>,
    provider_npi_list: Option<&'a [i64]>,
    provider_tin_type: Option<&'a str>,
    provider_tin_value: Option<&'a str>,
    in_name: Option<&'a str>,
    in_description: Option<&'a str>,
    in_negotiation_arrangement: Option<&'a str>,
    in_billing_code_type: Option<&'a str>,
    in_billing_code: Option<&'a str>,
    in_billing_code_type_version: Option<&'a str>,
    in_bc_billing_code_type: Option<&'a str>,
    in_bc_billing_code: Option<&'a str>,
    in_bc_billing_code_type_version: Option<&'a str>,
    in_bc_description: Option<&'a str>,
    in_np_negotiated_type: Option<&'a str>,
    in_np_billing_class: Option<&'a str>,
    in_np_expiration_date: Option<&'a str>,
    in_np_negotiated_rate: Option<f64>,
    in_np_additional_information: Option<&'a str>,
    in_np_service_codes: Option<&'a [String]>,
    in_np_billing_code_modifiers: Option<&'a [String]>,
    in_nr_provider_references: Option<&'a [String]>,
}

impl<'a> Row<'a> {
    fn from_record(record: &'a Record) -> Self {
        let mut row = Row {
            uuid: &record.uuid,
            parent_uuid: &record.parent_uuid,
            record_type: record.record_type().as_str(),
            ..Row::default()
        };
        match &record.kind {
            RecordKind::Root(root) => {
                row.reporting_entity_name = Some(&root.reporting_entity_name);
                row.reporting_entity_type = Some(&root.reporting_entity_type);
                row.last_updated_on = Some(&root.last_updated_on);
                row.version = Some(&root.version);
                row.plan_market_type = Some(&root.plan_market_type);
                row.plan_name = Some(&root.plan_name);
                row.plan_id_type = Some(&root.plan_id_type);
                row.plan_id = Some(&root.plan_id);
            }
            RecordKind::InNetwork(in_network) => {
                row.in_name = Some(&in_network.name);
                row.in_description = Some(&in_network.description);
                row.in_negotiation_arrangement = Some(&in_network.negotiation_arrangement);
                row.in_billing_code_type = Some(&in_network.billing_code_type);
                row.in_billing_code = Some(&in_network.billing_code);
                row.in_billing_code_type_version = Some(&in_network.billing_code_type_version);
            }
            RecordKind::BundledCodes(code) => {
                row.in_bc_billing_code_type = Some(&code.billing_code_type);
                row.in_bc_billing_code = Some(&code.billing_code);
                row.in_bc_billing_code_type_version = Some(&code.billing_code_type_version);
                row.in_bc_description = Some(&code.description);
            }
            RecordKind::NegotiatedRate(rate) => {
                row.in_nr_provider_references = Some(&rate.provider_references);
            }
            RecordKind::NegotiatedPrices(price) => {
                row.in_np_negotiated_type = Some(&price.negotiated_type);
                row.in_np_billing_class = Some(&price.billing_class);
                row.in_np_expiration_date = Some(&price.expiration_date);
                row.in_np_negotiated_rate = Some(price.negotiated_rate);
                row.in_np_additional_information = Some(&price.additional_information);
                row.in_np_service_codes = Some(&price.service_codes);
                row.in_np_billing_code_modifiers = Some(&price.billing_code_modifiers);
            }
            RecordKind::ProviderGroup(group) => {
                row.provider_group_id = Some(&group.provider_group_id);
            }
            RecordKind::Provider(provider) => {
                row.provider_parent = Some(&provider.parent);
                row.provider_npi_list = Some(&provider.npi);
            }
            RecordKind::Tin(tin) => {
                row.provider_tin_type = Some(&tin.tin_type);
                row.provider_tin_value = Some(&tin.value);
            }
        }
        row
    }

    /// Cells in `COLUMNS` order.
    fn cells(&self) -> [Cell<'a>; 34] {
        [
            Cell::Utf8(Some(self.uuid)),
            Cell::Utf8(Some(self.parent_uuid)),
            Cell::Utf8(Some(self.record_type)),
            Cell::Utf8(self.reporting_entity_name),
            Cell::Utf8(self.reporting_entity_type),
            Cell::Utf8(self.last_updated_on),
            Cell::Utf8(self.version),
            Cell::Utf8(self.plan_market_type),
            Cell::Utf8(self.plan_name),
            Cell::Utf8(self.plan_id_type),
            Cell::Utf8(self.plan_id),
            Cell::Utf8(self.provider_group_id),
            Cell::Utf8(self.provider_parent),
            Cell::Int64List(self.provider_npi_list),
            Cell::Utf8(self.provider_tin_type),
            Cell::Utf8(self.provider_tin_value),
            Cell::Utf8(self.in_name),
            Cell::Utf8(self.in_description),
            Cell::Utf8(self.in_negotiation_arrangement),
            Cell::Utf8(self.in_billing_code_type),
            Cell::Utf8(self.in_billing_code),
            Cell::Utf8(self.in_billing_code_type_version),
            Cell::Utf8(self.in_bc_billing_code_type),
            Cell::Utf8(self.in_bc_billing_code),
            Cell::Utf8(self.in_bc_billing_code_type_version),
            Cell::Utf8(self.in_bc_description),
            Cell::Utf8(self.in_np_negotiated_type),
            Cell::Utf8(self.in_np_billing_class),
            Cell::Utf8(self.in_np_expiration_date),
            Cell::Float64(self.in_np_negotiated_rate),
            Cell::Utf8(self.in_np_additional_information),
            Cell::Utf8List(self.in_np_service_codes),
            Cell::Utf8List(self.in_np_billing_code_modifiers),
            Cell::Utf8List(self.in_nr_provider_references),
        ]
    }
}

enum ColumnBuilder {
    Utf8(StringBuilder),
    Float64(Float64Builder),
    Int64List(ListBuilder<Int64Builder>),
    Utf8List(ListBuilder<StringBuilder>),
}

impl ColumnBuilder {
    fn new(column_type: ColumnType) -> Self {
        match column_type {
            ColumnType::Utf8 => ColumnBuilder::Utf8(StringBuilder::new()),
            ColumnType::Float64 => ColumnBuilder::Float64(Float64Builder::new()),
            ColumnType::Int64List => ColumnBuilder::Int64List(ListBuilder::new(Int64Builder::new())),
            ColumnType::Utf8List => ColumnBuilder::Utf8List(ListBuilder::new(StringBuilder::new())),
        }
    }

    fn append(&mut self, cell: Cell<'_>) -> Result<()> {
        match (self, cell) {
            (ColumnBuilder::Utf8(b), Cell::Utf8(v)) => b.append_option(v),
            (ColumnBuilder::Float64(b), Cell::Float64(v)) => b.append_option(v),
            (ColumnBuilder::Int64List(b), Cell::Int64List(v)) => match v {
                Some(values) => {
                    b.values().append_slice(values);
                    b.append(true);
                }
                None => b.append_null(),
            },
            (ColumnBuilder::Utf8List(b), Cell::Utf8List(v)) => match v {
                Some(values) => {
                    for value in values {
                        b.values().append_value(value);
                    }
                    b.append(true);
                }
                None => b.append_null(),
            },
            (_, cell) => anyhow::bail!("cell {cell:?} does not match its column type"),
        }
        Ok(())
    }

    fn finish(&mut self) -> ArrayRef {
        match self {
            ColumnBuilder::Utf8(b) => Arc::new(b.finish()),
            ColumnBuilder::Float64(b) => Arc::new(b.finish()),
            ColumnBuilder::Int64List(b) => Arc::new(b.finish()),
            ColumnBuilder::Utf8List(b) => Arc::new(b.finish()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WriterOptions {
    pub max_row_group_size: usize,
    /// Rows buffered in the column builders before they go to the writer.
    pub flush_rows: usize,
}

/// Streaming Parquet writer for the wide MRF table.
///
/// Rows land in `<name>.tmp` and the file is renamed into place on
/// `finish`, so a crashed run never leaves a truncated file under the
/// final name.
pub struct MrfParquetWriter {
    output_path: PathBuf,
    tmp_path: PathBuf,
    schema: Arc<Schema>,
    writer: ArrowWriter<File>,
    builders: Vec<ColumnBuilder>,
    rows_in_batch: usize,
    rows_written: u64,
    flush_rows: usize,
}

impl MrfParquetWriter {
    pub fn try_new(output_path: &Path, options: WriterOptions) -> Result<Self> {
        if let Some(parent) = output_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed creating {}", parent.display()))?;
        }

        let file_name = output_path
            .file_name()
            .and_then(|x| x.to_str())
            .unwrap_or("output.parquet");
        let tmp_path = output_path.with_file_name(format!("{file_name}.tmp"));

        let schema = mrf_schema();
        let props = WriterProperties::builder()
            .set_compression(Compression::ZSTD(ZstdLevel::default()))
            .set_max_row_group_size(options.max_row_group_size.max(1))
            .build();

        let file = File::create(&tmp_path)
            .with_context(|| format!("Failed creating {}", tmp_path.display()))?;
        let writer = ArrowWriter::try_new(file, Arc::clone(&schema), Some(props))
            .context("Failed creating Parquet ArrowWriter")?;

        let builders = COLUMNS
            .iter()
            .map(|(_, column_type)| ColumnBuilder::new(*column_type))
            .collect();

        Ok(Self {
            output_path: output_path.to_path_buf(),
            tmp_path,
            schema,
            writer,
            builders,
            rows_in_batch: 0,
            rows_written: 0,
            flush_rows: options.flush_rows.max(1),
        })
    }

    /// Rows accepted so far, buffered ones included.
    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    pub fn push_record(&mut self, record: &Record) -> Result<()> {
        let row = Row::from_record(record);
        for (builder, cell) in self.builders.iter_mut().zip(row.cells()) {
            builder.append(cell)?;
        }
        self.rows_in_batch += 1;
        self.rows_written += 1;
        if self.rows_in_batch >= self.flush_rows {
            self.flush_batch()?;
        }
        Ok(())
    }

    pub fn finish(mut self) -> Result<PathBuf> {
        self.flush_batch()?;
        self.writer
            .close()
            .context("Failed closing Parquet writer")?;
        fs::rename(&self.tmp_path, &self.output_path).with_context(|| {
            format!(
                "Failed moving temp parquet {} to {}",
                self.tmp_path.display(),
                self.output_path.display()
            )
        })?;
        Ok(self.output_path)
    }

    pub fn abort(self) {
        // Leave nothing behind under either name.
        let _ = self.writer.close();
        let _ = fs::remove_file(&self.tmp_path);
    }

    fn flush_batch(&mut self) -> Result<()> {
        if self.rows_in_batch == 0 {
            return Ok(());
        }

        let arrays: Vec<ArrayRef> = self.builders.iter_mut().map(ColumnBuilder::finish).collect();
        let batch = RecordBatch::try_new(Arc::clone(&self.schema), arrays)
            .context("Failed creating RecordBatch for Parquet write")?;
        self.writer
            .write(&batch)
            .context("Failed writing Parquet RecordBatch")?;
        self.rows_in_batch = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        MrfRoot, NegotiatedPrice, NegotiatedRate, Provider, Record, RecordKind, new_record_id,
    };
    use arrow::array::{Array, Float64Array, ListArray, StringArray};
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    fn options(flush_rows: usize) -> WriterOptions {
        WriterOptions {
            max_row_group_size: 1_000,
            flush_rows,
        }
    }

    fn read_all(path: &Path) -> RecordBatch {
        let file = File::open(path).unwrap();
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .build()
            .unwrap();
        let batches: Vec<RecordBatch> = reader.map(|b| b.unwrap()).collect();
        arrow::compute::concat_batches(&mrf_schema(), &batches).unwrap()
    }

    fn strings<'a>(batch: &'a RecordBatch, column: &str) -> &'a StringArray {
        batch
            .column_by_name(column)
            .unwrap()
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap()
    }

    #[test]
    fn schema_matches_column_list() {
        let schema = mrf_schema();
        assert_eq!(schema.fields().len(), 34);
        assert_eq!(schema.field(0).name(), "uuid");
        assert_eq!(
            schema.field_with_name("provider_npi_list").unwrap().data_type(),
            &list_item(DataType::Int64)
        );
        assert_eq!(
            schema.field_with_name("in_np_negotiated_rate").unwrap().data_type(),
            &DataType::Float64
        );
    }

    #[test]
    fn writes_variants_with_unused_columns_null() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mrf_0000.zstd.parquet");

        let root = Record::root(MrfRoot {
            plan_id: "42".to_string(),
            ..MrfRoot::default()
        });
        let price = Record::new(
            new_record_id(),
            &root.uuid,
            RecordKind::NegotiatedPrices(NegotiatedPrice {
                negotiated_type: "negotiated".to_string(),
                billing_class: "professional".to_string(),
                expiration_date: "9999-12-31".to_string(),
                negotiated_rate: 12.5,
                additional_information: String::new(),
                service_codes: vec!["11".to_string(), "22".to_string()],
                billing_code_modifiers: Vec::new(),
            }),
        );
        let provider = Record::new(
            new_record_id(),
            &root.uuid,
            RecordKind::Provider(Provider {
                parent: "provider_references".to_string(),
                npi: vec![1821198789, 1770512915],
            }),
        );
        let rate = Record::new(
            new_record_id(),
            &root.uuid,
            RecordKind::NegotiatedRate(NegotiatedRate::default()),
        );

        // flush every 2 rows so more than one RecordBatch goes through the writer
        let mut writer = MrfParquetWriter::try_new(&path, options(2)).unwrap();
        for record in [&root, &price, &provider, &rate] {
            writer.push_record(record).unwrap();
        }
        assert_eq!(writer.rows_written(), 4);
        assert_eq!(writer.finish().unwrap(), path);
        assert!(!dir.path().join("mrf_0000.zstd.parquet.tmp").exists());

        let batch = read_all(&path);
        assert_eq!(batch.num_rows(), 4);

        let record_types = strings(&batch, "record_type");
        assert_eq!(record_types.value(0), "root");
        assert_eq!(record_types.value(1), "negotiated_prices");

        let parents = strings(&batch, "parent_uuid");
        assert_eq!(parents.value(0), "");
        assert_eq!(parents.value(1), root.uuid);

        let plan_ids = strings(&batch, "plan_id");
        assert_eq!(plan_ids.value(0), "42");
        assert!(plan_ids.is_null(1));

        let rates = batch
            .column_by_name("in_np_negotiated_rate")
            .unwrap()
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();
        assert!(rates.is_null(0));
        assert_eq!(rates.value(1), 12.5);

        let npis = batch
            .column_by_name("provider_npi_list")
            .unwrap()
            .as_any()
            .downcast_ref::<ListArray>()
            .unwrap();
        assert!(npis.is_null(1));
        assert_eq!(npis.value(2).len(), 2);

        let references = batch
            .column_by_name("in_nr_provider_references")
            .unwrap()
            .as_any()
            .downcast_ref::<ListArray>()
            .unwrap();
        assert!(!references.is_null(3));
        assert_eq!(references.value(3).len(), 0);
    }

    #[test]
    fn abort_removes_the_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mrf_0000.zstd.parquet");
        let mut writer = MrfParquetWriter::try_new(&path, options(10)).unwrap();
        writer
            .push_record(&Record::root(MrfRoot::default()))
            .unwrap();
        writer.abort();
        assert!(!path.exists());
        assert!(!dir.path().join("mrf_0000.zstd.parquet.tmp").exists());
    }
}
