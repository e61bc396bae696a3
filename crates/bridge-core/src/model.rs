//! Scan, channel and sample model of the data service.
//!
//! A scan owns named channels; each channel holds a contiguous sequence of typed
//! samples indexed `0..N`. Channel schemas are fixed when the channel is created.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::{BridgeError, BridgeResult};
use crate::experiment::document::ExitStatus;

/// Element type of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    /// IEEE 754 double
    Float64,
    /// Signed 64-bit integer (also used for narrower and unsigned numpy ints)
    Int64,
    /// Boolean
    Bool,
    /// Arbitrary JSON, stored as text
    Json,
}

impl DType {
    /// Map a descriptor `dtype` (and optional numpy element dtype) to a channel dtype.
    ///
    /// `number` → float64, `integer` → int64, `boolean` → bool, `array` → numpy
    /// family when given, anything else → JSON.
    pub fn from_descriptor(dtype: &str, numpy_dtype: Option<&str>) -> Self {
        match dtype {
            "number" => DType::Float64,
            "integer" => DType::Int64,
            "boolean" => DType::Bool,
            "array" => numpy_dtype.map(Self::from_numpy).unwrap_or(DType::Json),
            _ => DType::Json,
        }
    }

    /// Map a numpy dtype name to a channel dtype.
    pub fn from_numpy(numpy: &str) -> Self {
        // numpy also spells these with byte-order prefixes, e.g. "<f8"
        let name = numpy.trim_start_matches(['<', '>', '=', '|']);
        if name.starts_with("float") || name.starts_with('f') {
            DType::Float64
        } else if name.starts_with("int")
            || name.starts_with("uint")
            || name.starts_with('i')
            || name.starts_with('u')
        {
            DType::Int64
        } else if name.starts_with("bool") || name == "b1" || name == "?" {
            DType::Bool
        } else {
            DType::Json
        }
    }

    /// Name as published in channel metadata
    pub fn as_str(&self) -> &'static str {
        match self {
            DType::Float64 => "float64",
            DType::Int64 => "int64",
            DType::Bool => "bool",
            DType::Json => "json",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable schema of one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSchema {
    /// Channel name (the descriptor data key)
    pub name: String,
    /// Element type
    pub dtype: DType,
    /// Fixed shape, empty for scalars
    pub shape: Vec<usize>,
    /// Physical units
    #[serde(default)]
    pub units: Option<String>,
    /// Source signal
    #[serde(default)]
    pub source: String,
    /// Device group: "timer", "counters" or "axis"
    #[serde(default)]
    pub device: String,
}

impl ChannelSchema {
    /// Scalar channel with no units and no device group
    pub fn scalar(name: &str, dtype: DType) -> Self {
        Self {
            name: name.to_string(),
            dtype,
            shape: vec![],
            units: None,
            source: String::new(),
            device: String::new(),
        }
    }

    /// Whether a redefinition with `other` is allowed (same dtype and shape).
    pub fn is_compatible(&self, other: &ChannelSchema) -> bool {
        self.dtype == other.dtype && self.shape == other.shape
    }

    /// `dtype[shape]`, e.g. `float64[2,3]`
    pub fn describe(&self) -> String {
        let dims: Vec<String> = self.shape.iter().map(|d| d.to_string()).collect();
        format!("{}[{}]", self.dtype, dims.join(","))
    }

    /// Number of elements per sample
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }
}

/// One typed value.
///
/// Arrays are stored flattened in row-major order; the shape lives in the schema.
/// JSON values are kept as text so the value encodes with non self-describing
/// codecs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleValue {
    /// Scalar float
    Float(f64),
    /// Scalar integer
    Int(i64),
    /// Scalar boolean
    Bool(bool),
    /// Flattened float array
    FloatArray(Vec<f64>),
    /// Flattened integer array
    IntArray(Vec<i64>),
    /// Flattened boolean array
    BoolArray(Vec<bool>),
    /// Serialized JSON value
    Json(String),
}

impl SampleValue {
    /// Convert an event value to a sample of `schema`.
    ///
    /// Fails with `TypeMismatch` when the JSON type does not fit the dtype or an
    /// array does not flatten to the schema's element count.
    pub fn from_json(schema: &ChannelSchema, value: &Value) -> BridgeResult<Self> {
        if schema.dtype == DType::Json {
            return Ok(SampleValue::Json(value.to_string()));
        }
        if schema.shape.is_empty() {
            return scalar(schema, value).ok_or_else(|| mismatch(schema, value));
        }

        let mut leaves = Vec::with_capacity(schema.element_count());
        flatten(value, &mut leaves);
        if !value.is_array() || leaves.len() != schema.element_count() {
            return Err(mismatch(schema, value));
        }
        let converted = match schema.dtype {
            DType::Float64 => leaves
                .iter()
                .map(|v| v.as_f64())
                .collect::<Option<Vec<_>>>()
                .map(SampleValue::FloatArray),
            DType::Int64 => leaves
                .iter()
                .map(|v| as_int(v))
                .collect::<Option<Vec<_>>>()
                .map(SampleValue::IntArray),
            DType::Bool => leaves
                .iter()
                .map(|v| v.as_bool())
                .collect::<Option<Vec<_>>>()
                .map(SampleValue::BoolArray),
            DType::Json => None,
        };
        converted.ok_or_else(|| mismatch(schema, value))
    }

    /// Plain JSON rendering (arrays stay flat).
    pub fn to_json(&self) -> Value {
        match self {
            SampleValue::Float(v) => Value::from(*v),
            SampleValue::Int(v) => Value::from(*v),
            SampleValue::Bool(v) => Value::from(*v),
            SampleValue::FloatArray(v) => Value::from(v.clone()),
            SampleValue::IntArray(v) => Value::from(v.clone()),
            SampleValue::BoolArray(v) => Value::from(v.clone()),
            SampleValue::Json(text) => {
                serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.clone()))
            }
        }
    }

    /// Scalar float view, if this is a float or integer scalar
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SampleValue::Float(v) => Some(*v),
            SampleValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }
}

fn scalar(schema: &ChannelSchema, value: &Value) -> Option<SampleValue> {
    match schema.dtype {
        DType::Float64 => value.as_f64().map(SampleValue::Float),
        DType::Int64 => as_int(value).map(SampleValue::Int),
        DType::Bool => value.as_bool().map(SampleValue::Bool),
        DType::Json => Some(SampleValue::Json(value.to_string())),
    }
}

fn as_int(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_u64().and_then(|u| i64::try_from(u).ok()))
}

fn flatten<'a>(value: &'a Value, out: &mut Vec<&'a Value>) {
    match value {
        Value::Array(items) => items.iter().for_each(|item| flatten(item, out)),
        leaf => out.push(leaf),
    }
}

fn mismatch(schema: &ChannelSchema, value: &Value) -> BridgeError {
    let actual = match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "bool".to_string(),
        Value::Number(n) if n.is_f64() => "float".to_string(),
        Value::Number(_) => "integer".to_string(),
        Value::String(_) => "string".to_string(),
        Value::Array(items) => format!("array of {}", items.len()),
        Value::Object(_) => "object".to_string(),
    };
    BridgeError::TypeMismatch {
        channel: schema.name.clone(),
        expected: schema.describe(),
        actual,
    }
}

/// One sample of a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Position in the channel, contiguous from 0
    pub seq: u64,
    /// Source timestamp, seconds since the epoch
    pub timestamp: f64,
    /// Value
    pub value: SampleValue,
}

impl Sample {
    /// Create a sample
    pub fn new(seq: u64, timestamp: f64, value: SampleValue) -> Self {
        Self {
            seq,
            timestamp,
            value,
        }
    }
}

/// Address of one channel stream: `(run id, channel name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    /// Run id of the owning scan
    pub run_id: String,
    /// Channel name
    pub channel: String,
}

impl StreamKey {
    /// Create a key
    pub fn new(run_id: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            channel: channel.into(),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.run_id, self.channel)
    }
}

/// How a scan ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanOutcome {
    /// Stop document reported success
    Success,
    /// Stop document reported failure, or the bridge failed the scan
    Failed,
    /// Stop document reported abort
    Aborted,
}

impl ScanOutcome {
    /// `SUCCESS` or `ERROR`, as published in the scan end info
    pub fn end_reason(&self) -> &'static str {
        match self {
            ScanOutcome::Success => "SUCCESS",
            ScanOutcome::Failed | ScanOutcome::Aborted => "ERROR",
        }
    }
}

impl From<ExitStatus> for ScanOutcome {
    fn from(status: ExitStatus) -> Self {
        match status {
            ExitStatus::Success => ScanOutcome::Success,
            ExitStatus::Fail => ScanOutcome::Failed,
            ExitStatus::Abort => ScanOutcome::Aborted,
        }
    }
}

impl fmt::Display for ScanOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ScanOutcome::Success => "success",
            ScanOutcome::Failed => "failed",
            ScanOutcome::Aborted => "aborted",
        };
        f.write_str(label)
    }
}

/// Scan lifecycle. `Active → Closed` happens exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ScanState {
    /// Accepting channels and samples
    Active,
    /// Final, read-only
    Closed {
        /// Recorded outcome
        outcome: ScanOutcome,
        /// Free-form reason
        reason: String,
    },
}

impl ScanState {
    /// Whether the scan still accepts writes
    pub fn is_active(&self) -> bool {
        matches!(self, ScanState::Active)
    }

    /// Outcome, if closed
    pub fn outcome(&self) -> Option<ScanOutcome> {
        match self {
            ScanState::Active => None,
            ScanState::Closed { outcome, .. } => Some(*outcome),
        }
    }
}

/// Record fanned out by the relay: one appended sample with its address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayRecord {
    /// Run id
    pub run_id: String,
    /// Channel name
    pub channel: String,
    /// Appended sample
    pub sample: Sample,
}

impl RelayRecord {
    /// Stream key of this record
    pub fn key(&self) -> StreamKey {
        StreamKey::new(self.run_id.clone(), self.channel.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema(dtype: DType, shape: Vec<usize>) -> ChannelSchema {
        ChannelSchema {
            shape,
            ..ChannelSchema::scalar("ch", dtype)
        }
    }

    #[test]
    fn test_dtype_mapping() {
        assert_eq!(DType::from_descriptor("number", None), DType::Float64);
        assert_eq!(DType::from_descriptor("integer", None), DType::Int64);
        assert_eq!(DType::from_descriptor("boolean", None), DType::Bool);
        assert_eq!(DType::from_descriptor("array", Some("uint16")), DType::Int64);
        assert_eq!(DType::from_descriptor("array", Some("<f4")), DType::Float64);
        assert_eq!(DType::from_descriptor("array", None), DType::Json);
        assert_eq!(DType::from_descriptor("string", None), DType::Json);
    }

    #[test]
    fn test_scalar_conversion() {
        let float = schema(DType::Float64, vec![]);
        assert_eq!(
            SampleValue::from_json(&float, &json!(2)).unwrap(),
            SampleValue::Float(2.0)
        );
        assert!(matches!(
            SampleValue::from_json(&float, &json!("2.0")),
            Err(BridgeError::TypeMismatch { .. })
        ));

        let int = schema(DType::Int64, vec![]);
        assert_eq!(
            SampleValue::from_json(&int, &json!(-4)).unwrap(),
            SampleValue::Int(-4)
        );
        assert!(SampleValue::from_json(&int, &json!(1.5)).is_err());
    }

    #[test]
    fn test_array_must_match_shape() {
        let image = schema(DType::Int64, vec![2, 2]);
        let value = SampleValue::from_json(&image, &json!([[1, 2], [3, 4]])).unwrap();
        assert_eq!(value, SampleValue::IntArray(vec![1, 2, 3, 4]));

        assert!(SampleValue::from_json(&image, &json!([1, 2, 3])).is_err());
        assert!(SampleValue::from_json(&image, &json!(4)).is_err());
    }

    #[test]
    fn test_json_values_survive_bincode() {
        let any = schema(DType::Json, vec![]);
        let value = SampleValue::from_json(&any, &json!({"mode": "fast"})).unwrap();
        let sample = Sample::new(0, 1.0, value);

        let bytes = bincode::serialize(&sample).unwrap();
        let back: Sample = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.value.to_json(), json!({"mode": "fast"}));
    }

    #[test]
    fn test_schema_compatibility() {
        let a = schema(DType::Float64, vec![]);
        let mut b = schema(DType::Float64, vec![]);
        b.units = Some("mm".into());
        assert!(a.is_compatible(&b));

        let c = schema(DType::Int64, vec![]);
        assert!(!a.is_compatible(&c));
        assert_eq!(schema(DType::Float64, vec![2, 3]).describe(), "float64[2,3]");
    }

    #[test]
    fn test_outcome_from_exit_status() {
        assert_eq!(ScanOutcome::from(ExitStatus::Abort), ScanOutcome::Aborted);
        assert_eq!(ScanOutcome::Failed.end_reason(), "ERROR");
        assert_eq!(ScanOutcome::Success.end_reason(), "SUCCESS");
    }
}
