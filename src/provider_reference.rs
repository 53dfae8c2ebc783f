use serde_json::Value;

use crate::{
    fields::{
        SchemaError, as_object, has_field, required_array, required_i64_list, required_object,
        required_str,
    },
    filters::{Extraction, ProviderReferenceFilter, Rejection},
    model::{Provider, ProviderGroup, Record, RecordKind, Tin, new_record_id},
};

/// `provider_parent` value for groups found in provider-reference shards.
pub const PROVIDER_REFERENCES_PARENT: &str = "provider_references";

/// Phase-2 extractor: gates each provider-reference object on the
/// references collected during phase 1.
pub struct ProviderReferenceExtractor<'a> {
    filter: &'a ProviderReferenceFilter,
}

impl<'a> ProviderReferenceExtractor<'a> {
    pub fn new(filter: &'a ProviderReferenceFilter) -> Self {
        Self { filter }
    }

    pub fn extract(&self, value: &Value, parent_uuid: &str) -> Result<Extraction, SchemaError> {
        let obj = as_object(value)?;
        if has_field(obj, "location") {
            return Err(SchemaError::Unsupported("location"));
        }

        let provider_group_id = required_str(obj, "provider_group_id")?;
        if !self.filter.contains(&provider_group_id) {
            return Ok(Extraction::Rejected(Rejection::ProviderGroupNotReferenced {
                provider_group_id,
            }));
        }

        let group_uuid = new_record_id();
        let groups = required_array(obj, "provider_groups")?;
        let mut records = Vec::with_capacity(1 + groups.len() * 2);
        records.push(Record::new(
            group_uuid.clone(),
            parent_uuid,
            RecordKind::ProviderGroup(ProviderGroup { provider_group_id }),
        ));
        extract_provider_groups(groups, &group_uuid, PROVIDER_REFERENCES_PARENT, &mut records)?;
        Ok(Extraction::Accepted(records))
    }
}

/// Emits one `provider` and one `tin` record per element of a
/// `provider_groups` array, all parented to `parent_uuid`.
pub fn extract_provider_groups(
    groups: &[Value],
    parent_uuid: &str,
    parent_label: &str,
    records: &mut Vec<Record>,
) -> Result<(), SchemaError> {
    for group in groups {
        let group = as_object(group)?;
        let npi = required_i64_list(group, "npi")?;
        records.push(Record::new(
            new_record_id(),
            parent_uuid,
            RecordKind::Provider(Provider {
                parent: parent_label.to_string(),
                npi,
            }),
        ));

        let tin = required_object(group, "tin")?;
        records.push(Record::new(
            new_record_id(),
            parent_uuid,
            RecordKind::Tin(Tin {
                tin_type: required_str(tin, "type")?,
                value: required_str(tin, "value")?,
            }),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RecordType;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "provider_group_id": 62.0003430048,
            "provider_groups": [
                { "npi": [1821198789], "tin": { "type": "ein", "value": "1821198789" } },
                { "npi": [1770512915, 987654321], "tin": { "type": "npi", "value": "1770512915" } }
            ]
        })
    }

    fn accepted(extraction: Extraction) -> Vec<Record> {
        match extraction {
            Extraction::Accepted(records) => records,
            Extraction::Rejected(reason) => panic!("unexpected rejection: {reason}"),
        }
    }

    #[test]
    fn referenced_group_yields_group_then_children() {
        let filter: ProviderReferenceFilter = ["62.0003430048", "2342423423"].into_iter().collect();
        let records = accepted(
            ProviderReferenceExtractor::new(&filter)
                .extract(&sample(), "root-id")
                .unwrap(),
        );

        // 1 provider_group, 2 provider, 2 tin
        assert_eq!(records.len(), 5);
        let group = &records[0];
        assert_eq!(group.record_type(), RecordType::ProviderGroup);
        assert_eq!(group.parent_uuid, "root-id");
        assert_eq!(
            group.kind,
            RecordKind::ProviderGroup(ProviderGroup {
                provider_group_id: "62.0003430048".to_string()
            })
        );

        for child in &records[1..] {
            assert_eq!(child.parent_uuid, group.uuid);
        }
        assert_eq!(
            records[1].kind,
            RecordKind::Provider(Provider {
                parent: "provider_references".to_string(),
                npi: vec![1821198789],
            })
        );
        assert_eq!(
            records[2].kind,
            RecordKind::Tin(Tin {
                tin_type: "ein".to_string(),
                value: "1821198789".to_string(),
            })
        );
        assert_eq!(
            records[3].kind,
            RecordKind::Provider(Provider {
                parent: "provider_references".to_string(),
                npi: vec![1770512915, 987654321],
            })
        );
        assert_eq!(records[4].record_type(), RecordType::Tin);
    }

    #[test]
    fn unreferenced_group_is_rejected_without_records() {
        let filter: ProviderReferenceFilter = ["A", "B"].into_iter().collect();
        let value = json!({
            "provider_group_id": "C",
            "provider_groups": [{ "npi": [1], "tin": { "type": "ein", "value": "1" } }]
        });
        let extraction = ProviderReferenceExtractor::new(&filter)
            .extract(&value, "root-id")
            .unwrap();
        assert!(matches!(
            extraction,
            Extraction::Rejected(Rejection::ProviderGroupNotReferenced { ref provider_group_id })
                if provider_group_id == "C"
        ));
    }

    #[test]
    fn rejection_happens_before_the_subtree_is_validated() {
        let filter: ProviderReferenceFilter = ["A"].into_iter().collect();
        let value = json!({ "provider_group_id": "C" });
        assert!(matches!(
            ProviderReferenceExtractor::new(&filter).extract(&value, "root-id"),
            Ok(Extraction::Rejected(_))
        ));
    }

    #[test]
    fn location_objects_are_unsupported() {
        let filter: ProviderReferenceFilter = ["62.0003430048"].into_iter().collect();
        let value = json!({ "provider_group_id": 62.0003430048, "location": "https://example.com/pg.json" });
        assert_eq!(
            ProviderReferenceExtractor::new(&filter)
                .extract(&value, "root-id")
                .unwrap_err(),
            SchemaError::Unsupported("location")
        );
    }

    #[test]
    fn missing_tin_is_fatal() {
        let filter: ProviderReferenceFilter = ["7"].into_iter().collect();
        let value = json!({ "provider_group_id": 7, "provider_groups": [{ "npi": [1] }] });
        assert_eq!(
            ProviderReferenceExtractor::new(&filter)
                .extract(&value, "root-id")
                .unwrap_err(),
            SchemaError::missing("tin")
        );
    }
}
