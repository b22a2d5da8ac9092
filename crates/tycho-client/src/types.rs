//! Domain payload types carried inside envelope data.
//!
//! These mirror the server's JSON vocabulary: engineering values as tagged
//! unions, parameter deliveries with numeric-id indirection, and the event,
//! alarm and command-history records pushed over their topics.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Engineering or raw value of a parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Value {
    Float { value: f32 },
    Double { value: f64 },
    Sint32 { value: i32 },
    Uint32 { value: u32 },
    Sint64 { value: i64 },
    Uint64 { value: u64 },
    Boolean { value: bool },
    String { value: String },
    Enumerated { value: String },
    Timestamp { value: DateTime<Utc> },
    Binary {
        #[serde(with = "tycho_wire::base64_bytes")]
        value: Vec<u8>,
    },
    Aggregate {
        #[serde(default)]
        name: Vec<String>,
        #[serde(default)]
        value: Vec<Value>,
    },
    Array {
        #[serde(default)]
        value: Vec<Value>,
    },
}

impl Value {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float { value } => Some(*value as f64),
            Value::Double { value } => Some(*value),
            Value::Sint32 { value } => Some(*value as f64),
            Value::Uint32 { value } => Some(*value as f64),
            Value::Sint64 { value } => Some(*value as f64),
            Value::Uint64 { value } => Some(*value as f64),
            Value::Boolean { value } => Some(u8::from(*value) as f64),
            _ => None,
        }
    }

    /// Human-readable rendering used for discrete domains.
    pub fn display_string(&self) -> String {
        match self {
            Value::Float { value } => value.to_string(),
            Value::Double { value } => value.to_string(),
            Value::Sint32 { value } => value.to_string(),
            Value::Uint32 { value } => value.to_string(),
            Value::Sint64 { value } => value.to_string(),
            Value::Uint64 { value } => value.to_string(),
            Value::Boolean { value } => value.to_string(),
            Value::String { value } | Value::Enumerated { value } => value.clone(),
            Value::Timestamp { value } => value.to_rfc3339(),
            Value::Binary { value } => format!("{} bytes", value.len()),
            Value::Aggregate { name, .. } => format!("aggregate[{}]", name.join(",")),
            Value::Array { value } => format!("array[{}]", value.len()),
        }
    }

    /// Walk into an aggregate or array with a dotted path such as
    /// `sensors[2].temperature`. An empty path returns the value itself.
    pub fn extract(&self, path: &str) -> Option<&Value> {
        let mut current = self;
        for segment in parse_path(path)? {
            match segment {
                PathSegment::Member(member) => {
                    let Value::Aggregate { name, value } = current else {
                        return None;
                    };
                    let index = name.iter().position(|n| n == &member)?;
                    current = value.get(index)?;
                }
                PathSegment::Index(index) => {
                    let Value::Array { value } = current else {
                        return None;
                    };
                    current = value.get(index)?;
                }
            }
        }
        Some(current)
    }
}

enum PathSegment {
    Member(String),
    Index(usize),
}

// `a.b[3].c` becomes Member(a), Member(b), Index(3), Member(c).
fn parse_path(path: &str) -> Option<Vec<PathSegment>> {
    let mut segments = Vec::new();
    for part in path.split('.').filter(|part| !part.is_empty()) {
        let mut rest = part;
        if let Some(bracket) = rest.find('[') {
            let member = &rest[..bracket];
            if !member.is_empty() {
                segments.push(PathSegment::Member(member.to_string()));
            }
            rest = &rest[bracket..];
            while let Some(stripped) = rest.strip_prefix('[') {
                let close = stripped.find(']')?;
                let index = stripped[..close].parse().ok()?;
                segments.push(PathSegment::Index(index));
                rest = &stripped[close + 1..];
            }
            if !rest.is_empty() {
                return None;
            }
        } else {
            segments.push(PathSegment::Member(rest.to_string()));
        }
    }
    Some(segments)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AcquisitionStatus {
    Acquired,
    NotReceived,
    Invalid,
    Expired,
}

/// One delivered parameter value. The `numeric_id` refers into the
/// subscription's id-to-name mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterValue {
    #[serde(default)]
    pub numeric_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eng_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquisition_status: Option<AcquisitionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_time: Option<DateTime<Utc>>,
}

impl ParameterValue {
    pub fn is_acquired(&self) -> bool {
        matches!(self.acquisition_status, Some(AcquisitionStatus::Acquired))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamedObjectId {
    pub name: String,
}

/// Push payload on the parameters topic: optional id mapping updates plus a
/// batch of values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterData {
    /// JSON object keys are the decimal numeric ids.
    #[serde(default)]
    pub mapping: HashMap<String, NamedObjectId>,
    #[serde(default)]
    pub invalid: Vec<u32>,
    #[serde(default)]
    pub values: Vec<ParameterValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventSeverity {
    Info,
    Watch,
    Warning,
    Distress,
    Critical,
    Severe,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<EventSeverity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub seq_num: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub acknowledged: bool,
    #[serde(default)]
    pub violations: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalAlarmStatus {
    #[serde(default)]
    pub unacknowledged_count: u32,
    #[serde(default)]
    pub acknowledged_count: u32,
    #[serde(default)]
    pub shelved_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandAttribute {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandAssignment {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandHistoryEntry {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub command_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attr: Vec<CommandAttribute>,
    #[serde(default)]
    pub assignments: Vec<CommandAssignment>,
}

/// Push payload on the time topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeData {
    pub value: DateTime<Utc>,
}

/// One bucket of the server-side sample endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub avg: f64,
    #[serde(default)]
    pub min: f64,
    #[serde(default)]
    pub max: f64,
    #[serde(default)]
    pub n: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitInfo {
    #[serde(default)]
    pub unit: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_inclusive: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_inclusive: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmInfo {
    #[serde(default)]
    pub static_alarm_ranges: Vec<AlarmRange>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterTypeInfo {
    #[serde(default)]
    pub eng_type: Option<String>,
    #[serde(default)]
    pub unit_set: Vec<UnitInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_alarm: Option<AlarmInfo>,
}

/// Mission-database description of a parameter, used for one-time unit and
/// threshold lookups.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterInfo {
    #[serde(default)]
    pub qualified_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#type: Option<ParameterTypeInfo>,
}

impl ParameterInfo {
    /// First engineering unit, if the mission database declares one.
    pub fn unit(&self) -> Option<&str> {
        self.r#type
            .as_ref()?
            .unit_set
            .first()
            .map(|unit| unit.unit.as_str())
    }
}
