use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::{
    constants::PLAN_ID_UNSET,
    model::{MrfRoot, Record},
    storage::Source,
};

/// Root shard as published. Every field is optional and scalar values may
/// arrive as strings or numbers.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RootDocument {
    #[serde(deserialize_with = "lenient_string")]
    reporting_entity_name: String,
    #[serde(deserialize_with = "lenient_string")]
    reporting_entity_type: String,
    #[serde(deserialize_with = "lenient_string")]
    last_updated_on: String,
    #[serde(deserialize_with = "lenient_string")]
    version: String,
    #[serde(deserialize_with = "lenient_string")]
    plan_market_type: String,
    #[serde(deserialize_with = "lenient_string")]
    plan_name: String,
    #[serde(deserialize_with = "lenient_string")]
    plan_id_type: String,
    #[serde(deserialize_with = "lenient_string")]
    plan_id: String,
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(String::new()),
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a scalar, found {other}"
        ))),
    }
}

impl From<RootDocument> for MrfRoot {
    fn from(doc: RootDocument) -> Self {
        MrfRoot {
            reporting_entity_name: doc.reporting_entity_name,
            reporting_entity_type: doc.reporting_entity_type,
            last_updated_on: doc.last_updated_on,
            version: doc.version,
            plan_market_type: doc.plan_market_type,
            plan_name: doc.plan_name,
            plan_id_type: doc.plan_id_type,
            plan_id: doc.plan_id,
        }
    }
}

/// Builds the single root record. A `plan_id` other than
/// [`PLAN_ID_UNSET`] replaces whatever the document says.
pub fn parse_root(doc: &[u8], plan_id: i64) -> Result<Record> {
    let doc: RootDocument =
        serde_json::from_slice(doc).context("Failed parsing root document")?;
    let mut root = MrfRoot::from(doc);
    if plan_id != PLAN_ID_UNSET {
        root.plan_id = plan_id.to_string();
    }
    Ok(Record::root(root))
}

pub async fn read_root(source: &Source, plan_id: i64) -> Result<Record> {
    let doc = source
        .read_all()
        .await
        .with_context(|| format!("Failed reading root shard {source}"))?;
    parse_root(&doc, plan_id).with_context(|| format!("Failed parsing {source}"))
}
