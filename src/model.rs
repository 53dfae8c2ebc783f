use std::fmt;

use uuid::Uuid;

/// Discriminator written to the `record_type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    Root,
    InNetwork,
    BundledCodes,
    NegotiatedRate,
    NegotiatedPrices,
    ProviderGroup,
    Provider,
    Tin,
}

impl RecordType {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordType::Root => "root",
            RecordType::InNetwork => "in_network",
            RecordType::BundledCodes => "bundled_codes",
            RecordType::NegotiatedRate => "negotiated_rate",
            RecordType::NegotiatedPrices => "negotiated_prices",
            RecordType::ProviderGroup => "provider_group",
            RecordType::Provider => "provider",
            RecordType::Tin => "tin",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plan / reporting-entity metadata from the root shard.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MrfRoot {
    pub reporting_entity_name: String,
    pub reporting_entity_type: String,
    pub last_updated_on: String,
    pub version: String,
    pub plan_market_type: String,
    pub plan_name: String,
    pub plan_id_type: String,
    pub plan_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InNetwork {
    pub name: String,
    pub description: String,
    pub negotiation_arrangement: String,
    pub billing_code_type: String,
    pub billing_code: String,
    pub billing_code_type_version: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BundledCode {
    pub billing_code_type: String,
    pub billing_code: String,
    pub billing_code_type_version: String,
    pub description: String,
}

/// Empty `provider_references` marks a rate whose providers were listed
/// inline as `provider_groups`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NegotiatedRate {
    pub provider_references: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NegotiatedPrice {
    pub negotiated_type: String,
    pub billing_class: String,
    pub expiration_date: String,
    pub negotiated_rate: f64,
    pub additional_information: String,
    pub service_codes: Vec<String>,
    pub billing_code_modifiers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderGroup {
    pub provider_group_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Provider {
    /// Name of the array the group was found under
    /// (`negotiated_rates` or `provider_references`).
    pub parent: String,
    pub npi: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tin {
    pub tin_type: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordKind {
    Root(MrfRoot),
    InNetwork(InNetwork),
    BundledCodes(BundledCode),
    NegotiatedRate(NegotiatedRate),
    NegotiatedPrices(NegotiatedPrice),
    ProviderGroup(ProviderGroup),
    Provider(Provider),
    Tin(Tin),
}

/// One output row. Records are built once during extraction and never
/// mutated afterwards; the flat column layout only exists in
/// `parquet_writer`.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub uuid: String,
    pub parent_uuid: String,
    pub kind: RecordKind,
}

impl Record {
    pub fn new(uuid: String, parent_uuid: &str, kind: RecordKind) -> Self {
        Self {
            uuid,
            parent_uuid: parent_uuid.to_string(),
            kind,
        }
    }

    /// The root has no parent; everything else hangs off an existing id.
    pub fn root(root: MrfRoot) -> Self {
        Self {
            uuid: new_record_id(),
            parent_uuid: String::new(),
            kind: RecordKind::Root(root),
        }
    }

    pub fn record_type(&self) -> RecordType {
        match &self.kind {
            RecordKind::Root(_) => RecordType::Root,
            RecordKind::InNetwork(_) => RecordType::InNetwork,
            RecordKind::BundledCodes(_) => RecordType::BundledCodes,
            RecordKind::NegotiatedRate(_) => RecordType::NegotiatedRate,
            RecordKind::NegotiatedPrices(_) => RecordType::NegotiatedPrices,
            RecordKind::ProviderGroup(_) => RecordType::ProviderGroup,
            RecordKind::Provider(_) => RecordType::Provider,
            RecordKind::Tin(_) => RecordType::Tin,
        }
    }
}

/// Time-ordered, globally unique record id.
pub fn new_record_id() -> String {
    Uuid::now_v7().to_string()
}
