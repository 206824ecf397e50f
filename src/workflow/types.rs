use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub type Variables = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    String,
    Long,
    Double,
    Boolean,
}

/// A variable in the engine's `{value, type}` form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedVariable {
    pub value: Value,
    #[serde(rename = "type")]
    pub kind: VariableType,
}

impl TypedVariable {
    /// Nulls have no engine type and are dropped. Arrays and objects travel as
    /// their JSON text. Date-like strings stay strings.
    pub fn from_value(value: &Value) -> Option<Self> {
        let (value, kind) = match value {
            Value::Null => return None,
            Value::Bool(_) => (value.clone(), VariableType::Boolean),
            Value::Number(n) if n.is_i64() || n.is_u64() => (value.clone(), VariableType::Long),
            Value::Number(_) => (value.clone(), VariableType::Double),
            Value::String(_) => (value.clone(), VariableType::String),
            Value::Array(_) | Value::Object(_) => (Value::String(value.to_string()), VariableType::String),
        };
        Some(Self { value, kind })
    }
}

pub fn to_engine_variables(variables: &Variables) -> BTreeMap<String, TypedVariable> {
    variables
        .iter()
        .filter_map(|(name, value)| TypedVariable::from_value(value).map(|typed| (name.clone(), typed)))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTask {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    pub process_instance_id: String,
    #[serde(deserialize_with = "engine_time")]
    pub create_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricProcessInstance {
    pub id: String,
    pub process_definition_key: String,
    #[serde(deserialize_with = "engine_time")]
    pub start_time: DateTime<Utc>,
    #[serde(default, deserialize_with = "optional_engine_time")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub start_user_id: Option<String>,
}

/// List endpoints wrap their results in a `data` array.
#[derive(Debug, Deserialize)]
pub(crate) struct DataPage<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreatedInstance {
    pub id: String,
}

/// Accepts RFC 3339 as well as the engine's `+0000` offset style.
pub(crate) fn parse_engine_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z"))
        .ok()
        .map(|time| time.with_timezone(&Utc))
}

fn engine_time<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_engine_time(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{}'", raw)))
}

fn optional_engine_time<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(raw) => parse_engine_time(&raw)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{}'", raw))),
        None => Ok(None),
    }
}
