use serde_json::Value;
use tracing::trace;

use crate::{
    fields::{
        Object, SchemaError, as_object, has_field, optional_array, optional_str,
        optional_string_list, required_array, required_f64, required_str,
    },
    filters::{Extraction, ProviderReferenceCollector, Rejection, ServiceAllowList},
    model::{
        BundledCode, InNetwork, NegotiatedPrice, NegotiatedRate, Record, RecordKind,
        new_record_id,
    },
    provider_reference::extract_provider_groups,
};

/// `provider_parent` value for groups listed inline on a negotiated rate.
pub const NEGOTIATED_RATES_PARENT: &str = "negotiated_rates";

/// Phase-1 extractor. Gates on the service allow-list and feeds every
/// provider reference it sees into the shared collector.
pub struct InNetworkExtractor<'a> {
    services: &'a ServiceAllowList,
    references: &'a ProviderReferenceCollector,
}

impl<'a> InNetworkExtractor<'a> {
    pub fn new(services: &'a ServiceAllowList, references: &'a ProviderReferenceCollector) -> Self {
        Self {
            services,
            references,
        }
    }

    /// Walks one in-network object depth first. Parents always precede
    /// their children in the returned records.
    pub fn extract(&self, value: &Value, parent_uuid: &str) -> Result<Extraction, SchemaError> {
        let obj = as_object(value)?;
        if has_field(obj, "covered_services") {
            return Err(SchemaError::Unsupported("covered_services"));
        }

        let billing_code_type = required_str(obj, "billing_code_type")?;
        let billing_code = required_str(obj, "billing_code")?;
        if !self.services.admits(&billing_code_type, &billing_code) {
            trace!(%billing_code_type, %billing_code, "in-network object not in service list");
            return Ok(Extraction::Rejected(Rejection::ServiceNotListed {
                billing_code_type,
                billing_code,
            }));
        }

        let in_network_uuid = new_record_id();
        let mut records = vec![Record::new(
            in_network_uuid.clone(),
            parent_uuid,
            RecordKind::InNetwork(InNetwork {
                name: required_str(obj, "name")?,
                // Nominally required, but plenty of published files omit it.
                description: optional_str(obj, "description")?.unwrap_or_default(),
                negotiation_arrangement: required_str(obj, "negotiation_arrangement")?,
                billing_code_type,
                billing_code,
                billing_code_type_version: required_str(obj, "billing_code_type_version")?,
            }),
        )];

        if let Some(bundled) = optional_array(obj, "bundled_codes")? {
            for code in bundled {
                records.push(bundled_code_record(as_object(code)?, &in_network_uuid)?);
            }
        }

        for rate in required_array(obj, "negotiated_rates")? {
            self.extract_negotiated_rate(as_object(rate)?, &in_network_uuid, &mut records)?;
        }

        Ok(Extraction::Accepted(records))
    }

    fn extract_negotiated_rate(
        &self,
        rate: &Object,
        in_network_uuid: &str,
        records: &mut Vec<Record>,
    ) -> Result<(), SchemaError> {
        let references = optional_string_list(rate, "provider_references")?;
        let groups = optional_array(rate, "provider_groups")?;
        if references.is_some() && groups.is_some() {
            return Err(SchemaError::AmbiguousProviders);
        }

        let rate_uuid = new_record_id();
        let rate_index = records.len();
        records.push(Record::new(
            rate_uuid.clone(),
            in_network_uuid,
            RecordKind::NegotiatedRate(NegotiatedRate::default()),
        ));

        for price in required_array(rate, "negotiated_prices")? {
            records.push(Record::new(
                new_record_id(),
                &rate_uuid,
                RecordKind::NegotiatedPrices(negotiated_price(as_object(price)?)?),
            ));
        }

        match (references, groups) {
            (Some(references), _) => {
                for reference in &references {
                    self.references.insert(reference);
                }
                records[rate_index].kind = RecordKind::NegotiatedRate(NegotiatedRate {
                    provider_references: references,
                });
            }
            (None, Some(groups)) => {
                extract_provider_groups(groups, in_network_uuid, NEGOTIATED_RATES_PARENT, records)?;
            }
            (None, None) => return Err(SchemaError::missing("provider_groups")),
        }
        Ok(())
    }
}

fn bundled_code_record(code: &Object, in_network_uuid: &str) -> Result<Record, SchemaError> {
    Ok(Record::new(
        new_record_id(),
        in_network_uuid,
        RecordKind::BundledCodes(BundledCode {
            billing_code_type: required_str(code, "billing_code_type")?,
            billing_code: required_str(code, "billing_code")?,
            billing_code_type_version: required_str(code, "billing_code_type_version")?,
            description: optional_str(code, "description")?.unwrap_or_default(),
        }),
    ))
}

fn negotiated_price(price: &Object) -> Result<NegotiatedPrice, SchemaError> {
    let billing_class = required_str(price, "billing_class")?;
    let service_codes = match optional_string_list(price, "service_code")? {
        Some(codes) => codes,
        None if billing_class == "professional" => return Err(SchemaError::MissingServiceCode),
        None => Vec::new(),
    };

    Ok(NegotiatedPrice {
        negotiated_type: required_str(price, "negotiated_type")?,
        billing_class,
        expiration_date: required_str(price, "expiration_date")?,
        negotiated_rate: required_f64(price, "negotiated_rate")?,
        additional_information: optional_str(price, "additional_information")?.unwrap_or_default(),
        service_codes,
        billing_code_modifiers: optional_string_list(price, "billing_code_modifier")?
            .unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        filters::ProviderReferenceFilter,
        model::{Provider, RecordType, Tin},
    };
    use serde_json::json;
    use std::sync::Arc;

    fn services() -> ServiceAllowList {
        ["2021", "53", "99213"].into_iter().collect()
    }

    fn price(billing_class: &str) -> Value {
        json!({
            "negotiated_type": "negotiated",
            "negotiated_rate": 123.45,
            "expiration_date": "9999-12-31",
            "service_code": ["11", "22"],
            "billing_class": billing_class,
            "billing_code_modifier": ["26"]
        })
    }

    fn in_network(rates: Value) -> Value {
        json!({
            "negotiation_arrangement": "ffs",
            "name": "Office visit",
            "billing_code_type": "CPT",
            "billing_code_type_version": "2022",
            "billing_code": "99213",
            "description": "Office or other outpatient visit",
            "negotiated_rates": rates
        })
    }

    fn extract(value: &Value) -> (Result<Extraction, SchemaError>, ProviderReferenceFilter) {
        let services = services();
        let collector = Arc::new(ProviderReferenceCollector::new());
        let result = InNetworkExtractor::new(&services, &collector).extract(value, "root-id");
        (result, collector.freeze().unwrap())
    }

    fn accepted(value: &Value) -> Vec<Record> {
        match extract(value).0.unwrap() {
            Extraction::Accepted(records) => records,
            Extraction::Rejected(reason) => panic!("unexpected rejection: {reason}"),
        }
    }

    fn of_type(records: &[Record], record_type: RecordType) -> Vec<&Record> {
        records
            .iter()
            .filter(|r| r.record_type() == record_type)
            .collect()
    }

    #[test]
    fn unlisted_codes_are_rejected() {
        let mut value = in_network(json!([]));
        value["billing_code"] = json!("888");
        let (result, _) = extract(&value);
        assert!(matches!(
            result.unwrap(),
            Extraction::Rejected(Rejection::ServiceNotListed { .. })
        ));
    }

    #[test]
    fn non_hcpcs_code_types_are_rejected_even_when_listed() {
        let mut value = in_network(json!([{
            "provider_references": [1],
            "negotiated_prices": [price("institutional")]
        }]));
        value["billing_code_type"] = json!("RC");
        let (result, filter) = extract(&value);
        assert!(matches!(result.unwrap(), Extraction::Rejected(_)));
        // The subtree is never visited, so nothing is collected either.
        assert_eq!(filter.len(), 0);
    }

    #[test]
    fn provider_references_are_collected_and_listed() {
        let value = in_network(json!([{
            "provider_references": [62.0004808658],
            "negotiated_prices": [price("institutional")]
        }]));
        let (result, filter) = extract(&value);
        let Extraction::Accepted(records) = result.unwrap() else {
            panic!("expected records");
        };

        let rates = of_type(&records, RecordType::NegotiatedRate);
        assert_eq!(rates.len(), 1);
        assert_eq!(
            rates[0].kind,
            RecordKind::NegotiatedRate(NegotiatedRate {
                provider_references: vec!["62.0004808658".to_string()]
            })
        );
        assert!(of_type(&records, RecordType::ProviderGroup).is_empty());
        assert!(of_type(&records, RecordType::Provider).is_empty());
        assert!(filter.contains("62.0004808658"));
    }

    #[test]
    fn inline_provider_groups_hang_off_the_in_network_record() {
        let value = in_network(json!([{
            "provider_groups": [{
                "npi": [1821198789],
                "tin": { "type": "ein", "value": "12-3456789" }
            }],
            "negotiated_prices": [price("institutional")]
        }]));
        let records = accepted(&value);
        let in_network_uuid = &records[0].uuid;

        let rates = of_type(&records, RecordType::NegotiatedRate);
        assert_eq!(rates.len(), 1);
        assert_eq!(
            rates[0].kind,
            RecordKind::NegotiatedRate(NegotiatedRate::default())
        );

        let providers = of_type(&records, RecordType::Provider);
        let tins = of_type(&records, RecordType::Tin);
        assert_eq!(providers.len(), 1);
        assert_eq!(tins.len(), 1);
        assert_eq!(&providers[0].parent_uuid, in_network_uuid);
        assert_eq!(&tins[0].parent_uuid, in_network_uuid);
        assert_eq!(
            providers[0].kind,
            RecordKind::Provider(Provider {
                parent: "negotiated_rates".to_string(),
                npi: vec![1821198789],
            })
        );
        assert_eq!(
            tins[0].kind,
            RecordKind::Tin(Tin {
                tin_type: "ein".to_string(),
                value: "12-3456789".to_string(),
            })
        );
    }

    #[test]
    fn full_subtree_is_parented_depth_first() {
        let mut value = in_network(json!([
            {
                "provider_references": [11925, 11926],
                "negotiated_prices": [price("professional"), price("institutional")]
            },
            {
                "provider_references": ["abc"],
                "negotiated_prices": [price("professional")]
            }
        ]));
        value["bundled_codes"] = json!([{
            "billing_code_type": "CPT",
            "billing_code_type_version": "2022",
            "billing_code": "53"
        }]);
        let records = accepted(&value);

        // in_network, bundled, rate, 2 prices, rate, 1 price
        assert_eq!(records.len(), 7);
        assert_eq!(records[0].record_type(), RecordType::InNetwork);
        assert_eq!(records[0].parent_uuid, "root-id");

        let bundled = &records[1];
        assert_eq!(bundled.parent_uuid, records[0].uuid);
        assert_eq!(
            bundled.kind,
            RecordKind::BundledCodes(BundledCode {
                billing_code_type: "CPT".to_string(),
                billing_code: "53".to_string(),
                billing_code_type_version: "2022".to_string(),
                description: String::new(),
            })
        );

        let seen: Vec<&str> = records.iter().map(|r| r.uuid.as_str()).collect();
        for (i, record) in records.iter().enumerate().skip(1) {
            let parent = seen
                .iter()
                .position(|id| *id == record.parent_uuid)
                .expect("parent must be emitted in the same subtree");
            assert!(parent < i, "parent must precede child");
        }

        let prices = of_type(&records, RecordType::NegotiatedPrices);
        assert_eq!(prices[0].parent_uuid, records[2].uuid);
        assert_eq!(prices[2].parent_uuid, records[5].uuid);
    }

    #[test]
    fn professional_prices_require_service_code() {
        let mut professional = price("professional");
        professional.as_object_mut().unwrap().remove("service_code");
        let value = in_network(json!([{
            "provider_references": [1],
            "negotiated_prices": [professional]
        }]));
        assert_eq!(extract(&value).0.unwrap_err(), SchemaError::MissingServiceCode);
    }

    #[test]
    fn institutional_prices_default_service_code() {
        let mut institutional = price("institutional");
        let obj = institutional.as_object_mut().unwrap();
        obj.remove("service_code");
        obj.remove("billing_code_modifier");
        let value = in_network(json!([{
            "provider_references": [1],
            "negotiated_prices": [institutional]
        }]));
        let records = accepted(&value);
        let prices = of_type(&records, RecordType::NegotiatedPrices);
        let RecordKind::NegotiatedPrices(price) = &prices[0].kind else {
            panic!("expected a price");
        };
        assert!(price.service_codes.is_empty());
        assert!(price.billing_code_modifiers.is_empty());
        assert_eq!(price.additional_information, "");
        assert_eq!(price.negotiated_rate, 123.45);
    }

    #[test]
    fn missing_description_defaults_to_empty() {
        let mut value = in_network(json!([{
            "provider_references": [1],
            "negotiated_prices": [price("institutional")]
        }]));
        value.as_object_mut().unwrap().remove("description");
        let records = accepted(&value);
        let RecordKind::InNetwork(in_network) = &records[0].kind else {
            panic!("expected in_network first");
        };
        assert_eq!(in_network.description, "");
    }

    #[test]
    fn missing_name_is_fatal() {
        let mut value = in_network(json!([]));
        value.as_object_mut().unwrap().remove("name");
        assert_eq!(extract(&value).0.unwrap_err(), SchemaError::missing("name"));
    }

    #[test]
    fn both_or_neither_provider_shapes_are_fatal() {
        let both = in_network(json!([{
            "provider_references": [1],
            "provider_groups": [],
            "negotiated_prices": [price("institutional")]
        }]));
        assert_eq!(extract(&both).0.unwrap_err(), SchemaError::AmbiguousProviders);

        let neither = in_network(json!([{
            "negotiated_prices": [price("institutional")]
        }]));
        assert_eq!(
            extract(&neither).0.unwrap_err(),
            SchemaError::missing("provider_groups")
        );
    }

    #[test]
    fn covered_services_are_unsupported() {
        let mut value = in_network(json!([]));
        value["covered_services"] = json!([]);
        assert_eq!(
            extract(&value).0.unwrap_err(),
            SchemaError::Unsupported("covered_services")
        );
    }
}
