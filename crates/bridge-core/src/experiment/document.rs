//! Document model for run engine output.
//!
//! Mirrors the Bluesky event-model documents that the control engine emits.
//! Documents travel as `(name, doc)` pairs, serialized as
//! `{"name": "start", "doc": {...}}`.
//!
//! - **StartDoc**: run intent and plan metadata (opens a run)
//! - **DescriptorDoc**: schema for the data keys of one event stream
//! - **EventDoc**: one row of readings for a descriptor
//! - **StopDoc**: completion status (closes a run)
//!
//! # Document Flow
//!
//! ```text
//! StartDoc (1)
//!    │
//!    ├── DescriptorDoc (1+, one per event stream)
//!    │       │
//!    │       └── EventDoc (N, readings)
//!    │
//! StopDoc (1)
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::error::{BridgeError, BridgeResult};

/// Generate a new unique document ID
pub fn new_uid() -> String {
    Uuid::new_v4().to_string()
}

/// Current time in seconds since the Unix epoch, as the run engine reports it.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Document kinds accepted from the control engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    /// Run start
    Start,
    /// Event stream schema
    Descriptor,
    /// Readings
    Event,
    /// Run stop
    Stop,
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DocumentKind::Start => "start",
            DocumentKind::Descriptor => "descriptor",
            DocumentKind::Event => "event",
            DocumentKind::Stop => "stop",
        };
        write!(f, "{}", label)
    }
}

/// One document from the run engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "doc", rename_all = "snake_case")]
pub enum Document {
    /// Run start document - intent and metadata
    Start(StartDoc),
    /// Event stream descriptor - schema definition
    Descriptor(DescriptorDoc),
    /// Event document - readings
    Event(EventDoc),
    /// Run stop document - completion status
    Stop(StopDoc),
}

impl Document {
    /// Parse a single `{"name": ..., "doc": ...}` JSON line.
    pub fn from_json(line: &str) -> BridgeResult<Self> {
        let doc: Document = serde_json::from_str(line)
            .map_err(|e| BridgeError::InvalidDocument(e.to_string()))?;
        doc.validate()?;
        Ok(doc)
    }

    /// Document kind tag
    pub fn kind(&self) -> DocumentKind {
        match self {
            Document::Start(_) => DocumentKind::Start,
            Document::Descriptor(_) => DocumentKind::Descriptor,
            Document::Event(_) => DocumentKind::Event,
            Document::Stop(_) => DocumentKind::Stop,
        }
    }

    /// Get the document UID
    pub fn uid(&self) -> &str {
        match self {
            Document::Start(d) => &d.uid,
            Document::Descriptor(d) => &d.uid,
            Document::Event(d) => &d.uid,
            Document::Stop(d) => &d.uid,
        }
    }

    /// Run id carried directly by the document.
    ///
    /// Events usually carry only their descriptor uid; the ingestor resolves
    /// those through the descriptor index.
    pub fn run_id(&self) -> Option<&str> {
        match self {
            Document::Start(d) => Some(&d.uid), // Start doc UID is the run id
            Document::Descriptor(d) => Some(&d.run_start),
            Document::Event(d) => d.run_start.as_deref(),
            Document::Stop(d) => Some(&d.run_start),
        }
    }

    /// Timestamp in seconds since the epoch
    pub fn time(&self) -> f64 {
        match self {
            Document::Start(d) => d.time,
            Document::Descriptor(d) => d.time,
            Document::Event(d) => d.time,
            Document::Stop(d) => d.time,
        }
    }

    /// Structural checks that serde alone does not enforce.
    pub fn validate(&self) -> BridgeResult<()> {
        if self.uid().is_empty() {
            return Err(BridgeError::InvalidDocument(format!(
                "{} document has an empty uid",
                self.kind()
            )));
        }
        if !self.time().is_finite() || self.time() < 0.0 {
            return Err(BridgeError::InvalidDocument(format!(
                "{} document {} has invalid time {}",
                self.kind(),
                self.uid(),
                self.time()
            )));
        }
        match self {
            Document::Start(_) => Ok(()),
            Document::Descriptor(d) => {
                if d.run_start.is_empty() {
                    return Err(BridgeError::InvalidDocument(format!(
                        "descriptor {} has an empty run_start",
                        d.uid
                    )));
                }
                if let Some(key) = d.data_keys.keys().find(|k| k.is_empty()) {
                    return Err(BridgeError::InvalidDocument(format!(
                        "descriptor {} declares an empty data key name '{}'",
                        d.uid, key
                    )));
                }
                Ok(())
            }
            Document::Event(e) => {
                if e.descriptor.is_empty() {
                    return Err(BridgeError::InvalidDocument(format!(
                        "event {} has an empty descriptor reference",
                        e.uid
                    )));
                }
                Ok(())
            }
            Document::Stop(s) => {
                if s.run_start.is_empty() {
                    return Err(BridgeError::InvalidDocument(format!(
                        "stop {} has an empty run_start",
                        s.uid
                    )));
                }
                Ok(())
            }
        }
    }
}

/// Start document - emitted at the beginning of a run
///
/// Contains plan configuration and user-provided metadata. Keys the bridge
/// does not interpret are kept in `metadata`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartDoc {
    /// Unique run identifier (this IS the run id)
    pub uid: String,
    /// Timestamp when the run started
    pub time: f64,
    /// Plan name, e.g. "scan" or "grid_scan"
    #[serde(default)]
    pub plan_name: String,
    /// Scan number assigned by the engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_id: Option<i64>,
    /// Detector names
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detectors: Option<Vec<String>>,
    /// Motor (axis) names
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motors: Option<Vec<String>>,
    /// Planned number of points
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_points: Option<u64>,
    /// Plan arguments as sent by the engine
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub plan_args: Value,
    /// Data policy tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_policy: Option<String>,
    /// Catalog metadata forwarded to the scan info
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub meta_catalog: Value,
    /// Any other start keys
    #[serde(flatten)]
    pub metadata: BTreeMap<String, Value>,
}

impl StartDoc {
    /// Create a start document with a fresh run id
    pub fn new(plan_name: &str) -> Self {
        Self {
            uid: new_uid(),
            time: now_secs(),
            plan_name: plan_name.to_string(),
            scan_id: None,
            detectors: None,
            motors: None,
            num_points: None,
            plan_args: Value::Null,
            data_policy: None,
            meta_catalog: Value::Null,
            metadata: BTreeMap::new(),
        }
    }

    /// Use a fixed run id
    pub fn with_uid(mut self, uid: &str) -> Self {
        self.uid = uid.to_string();
        self
    }

    /// Set the scan number
    pub fn with_scan_id(mut self, scan_id: i64) -> Self {
        self.scan_id = Some(scan_id);
        self
    }

    /// Add a detector name
    pub fn with_detector(mut self, name: &str) -> Self {
        self.detectors
            .get_or_insert_with(Vec::new)
            .push(name.to_string());
        self
    }

    /// Add a motor name
    pub fn with_motor(mut self, name: &str) -> Self {
        self.motors.get_or_insert_with(Vec::new).push(name.to_string());
        self
    }

    /// Set the planned number of points
    pub fn with_num_points(mut self, num_points: u64) -> Self {
        self.num_points = Some(num_points);
        self
    }

    /// Set the plan arguments
    pub fn with_plan_args(mut self, plan_args: Value) -> Self {
        self.plan_args = plan_args;
        self
    }

    /// Add a free-form metadata entry
    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Descriptor document - defines schema for event data
///
/// Each descriptor defines an event stream ("primary", "baseline", ...) with
/// named data keys, their types, shapes and units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorDoc {
    /// Unique descriptor ID
    pub uid: String,
    /// Links to StartDoc
    pub run_start: String,
    /// Timestamp
    pub time: f64,
    /// Stream name
    #[serde(default = "default_stream_name")]
    pub name: String,
    /// Schema for data fields, keyed by data key name
    #[serde(default)]
    pub data_keys: BTreeMap<String, DataKey>,
    /// Device configuration at descriptor creation time
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub configuration: Value,
}

fn default_stream_name() -> String {
    "primary".to_string()
}

impl DescriptorDoc {
    /// Create a descriptor for a run
    pub fn new(run_start: &str, name: &str) -> Self {
        Self {
            uid: new_uid(),
            run_start: run_start.to_string(),
            time: now_secs(),
            name: name.to_string(),
            data_keys: BTreeMap::new(),
            configuration: Value::Null,
        }
    }

    /// Add a data key
    pub fn with_data_key(mut self, name: &str, key: DataKey) -> Self {
        self.data_keys.insert(name.to_string(), key);
        self
    }
}

/// Schema for a data field within events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataKey {
    /// Data type: "number", "integer", "boolean", "string", "array"
    pub dtype: String,
    /// Shape for arrays (empty for scalars)
    #[serde(default)]
    pub shape: Vec<usize>,
    /// Source signal
    #[serde(default)]
    pub source: String,
    /// Owning device name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_name: Option<String>,
    /// Element dtype for arrays, numpy spelling ("float64", "uint16", ...)
    #[serde(
        default,
        alias = "numpy_dtype",
        skip_serializing_if = "Option::is_none"
    )]
    pub dtype_numpy: Option<String>,
    /// Display precision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<u32>,
    /// Physical units
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
}

impl DataKey {
    fn with_dtype(dtype: &str, source: &str) -> Self {
        Self {
            dtype: dtype.to_string(),
            shape: vec![],
            source: source.to_string(),
            object_name: None,
            dtype_numpy: None,
            precision: None,
            units: None,
        }
    }

    /// Create a scalar floating point data key
    pub fn number(source: &str) -> Self {
        Self::with_dtype("number", source)
    }

    /// Create a scalar integer data key
    pub fn integer(source: &str) -> Self {
        Self::with_dtype("integer", source)
    }

    /// Create a scalar boolean data key
    pub fn boolean(source: &str) -> Self {
        Self::with_dtype("boolean", source)
    }

    /// Create an array data key with a numpy element dtype
    pub fn array(source: &str, numpy_dtype: &str, shape: Vec<usize>) -> Self {
        let mut key = Self::with_dtype("array", source);
        key.dtype_numpy = Some(numpy_dtype.to_string());
        key.shape = shape;
        key
    }

    /// Set the owning device name
    pub fn with_object_name(mut self, name: &str) -> Self {
        self.object_name = Some(name.to_string());
        self
    }

    /// Set physical units
    pub fn with_units(mut self, units: &str) -> Self {
        self.units = Some(units.to_string());
        self
    }
}

/// Event document - one row of readings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDoc {
    /// Unique event ID
    pub uid: String,
    /// Links to DescriptorDoc that defines schema
    pub descriptor: String,
    /// Optional run id, when the engine adds it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_start: Option<String>,
    /// Event sequence number within the descriptor stream (1-based in Bluesky)
    #[serde(default)]
    pub seq_num: u64,
    /// Timestamp
    pub time: f64,
    /// Readings (data key -> value)
    #[serde(default)]
    pub data: BTreeMap<String, Value>,
    /// Per-key timestamps (data key -> seconds)
    #[serde(default)]
    pub timestamps: BTreeMap<String, f64>,
}

impl EventDoc {
    /// Create an event for a descriptor
    pub fn new(descriptor: &str, seq_num: u64) -> Self {
        Self {
            uid: new_uid(),
            descriptor: descriptor.to_string(),
            run_start: None,
            seq_num,
            time: now_secs(),
            data: BTreeMap::new(),
            timestamps: BTreeMap::new(),
        }
    }

    /// Add a reading
    pub fn with_datum(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.data.insert(field.to_string(), value.into());
        self.timestamps.insert(field.to_string(), self.time);
        self
    }

    /// Set the event time
    pub fn with_time(mut self, time: f64) -> Self {
        self.time = time;
        self
    }
}

/// Exit status reported by the stop document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitStatus {
    /// Plan completed
    Success,
    /// Plan raised an error
    Fail,
    /// Plan was aborted by the operator
    Abort,
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ExitStatus::Success => "success",
            ExitStatus::Fail => "fail",
            ExitStatus::Abort => "abort",
        };
        write!(f, "{}", label)
    }
}

/// Stop document - emitted at the end of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopDoc {
    /// Unique stop doc ID
    pub uid: String,
    /// Links to StartDoc
    pub run_start: String,
    /// Timestamp when run ended
    pub time: f64,
    /// Exit status
    pub exit_status: ExitStatus,
    /// Reason for abort/failure
    #[serde(default)]
    pub reason: String,
    /// Events emitted per stream. A bare total is kept under `"total"`.
    #[serde(default, deserialize_with = "num_events_map")]
    pub num_events: BTreeMap<String, u64>,
}

fn num_events_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumEvents {
        PerStream(BTreeMap<String, u64>),
        Total(u64),
    }
    Ok(match Option::<NumEvents>::deserialize(deserializer)? {
        Some(NumEvents::PerStream(map)) => map,
        Some(NumEvents::Total(total)) => BTreeMap::from([("total".to_string(), total)]),
        None => BTreeMap::new(),
    })
}

impl StopDoc {
    fn with_status(run_start: &str, exit_status: ExitStatus, reason: &str) -> Self {
        Self {
            uid: new_uid(),
            run_start: run_start.to_string(),
            time: now_secs(),
            exit_status,
            reason: reason.to_string(),
            num_events: BTreeMap::new(),
        }
    }

    /// Successful completion
    pub fn success(run_start: &str) -> Self {
        Self::with_status(run_start, ExitStatus::Success, "")
    }

    /// Aborted run
    pub fn abort(run_start: &str, reason: &str) -> Self {
        Self::with_status(run_start, ExitStatus::Abort, reason)
    }

    /// Failed run
    pub fn fail(run_start: &str, reason: &str) -> Self {
        Self::with_status(run_start, ExitStatus::Fail, reason)
    }

    /// Record the event count of a stream
    pub fn with_num_events(mut self, stream: &str, count: u64) -> Self {
        self.num_events.insert(stream.to_string(), count);
        self
    }

    /// Total events over all streams
    pub fn total_events(&self) -> u64 {
        self.num_events.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stop_num_events_as_total() {
        let line = r#"{"name":"stop","doc":{"uid":"s1","run_start":"r1","time":2.0,"exit_status":"success","num_events":5}}"#;
        let Document::Stop(stop) = Document::from_json(line).unwrap() else {
            panic!("expected stop");
        };
        assert_eq!(stop.total_events(), 5);
    }

    #[test]
    fn test_start_doc_builder() {
        let doc = StartDoc::new("grid_scan")
            .with_scan_id(7)
            .with_motor("motor1")
            .with_detector("det1")
            .with_metadata("operator", "Alice");

        assert_eq!(doc.plan_name, "grid_scan");
        assert_eq!(doc.scan_id, Some(7));
        assert_eq!(doc.motors, Some(vec!["motor1".to_string()]));
        assert_eq!(doc.metadata.get("operator"), Some(&json!("Alice")));
    }

    #[test]
    fn test_parse_bluesky_pair() {
        let line = r#"{"name": "start", "doc": {"uid": "r1", "time": 1700000000.5,
            "plan_name": "count", "detectors": ["det1"], "beamline": "P65"}}"#;
        let doc = Document::from_json(line).unwrap();

        assert_eq!(doc.kind(), DocumentKind::Start);
        assert_eq!(doc.run_id(), Some("r1"));
        match doc {
            Document::Start(start) => {
                assert_eq!(start.detectors, Some(vec!["det1".to_string()]));
                assert_eq!(start.metadata.get("beamline"), Some(&json!("P65")));
            }
            other => panic!("unexpected document {:?}", other),
        }
    }

    #[test]
    fn test_descriptor_accepts_numpy_dtype_alias() {
        let line = r#"{"name": "descriptor", "doc": {"uid": "d1", "run_start": "r1",
            "time": 1.0, "data_keys": {"img": {"dtype": "array", "shape": [2, 2],
            "source": "sim", "numpy_dtype": "uint16"}}}}"#;
        let doc = Document::from_json(line).unwrap();

        match doc {
            Document::Descriptor(desc) => {
                assert_eq!(desc.name, "primary");
                let key = &desc.data_keys["img"];
                assert_eq!(key.dtype_numpy.as_deref(), Some("uint16"));
                assert_eq!(key.shape, vec![2, 2]);
            }
            other => panic!("unexpected document {:?}", other),
        }
    }

    #[test]
    fn test_event_run_id_is_optional() {
        let event = EventDoc::new("d1", 1).with_datum("det1", 1.5);
        let doc = Document::Event(event);

        assert_eq!(doc.run_id(), None);
        assert!(doc.validate().is_ok());
    }

    #[test]
    fn test_rejects_unknown_kind_and_bad_time() {
        let unknown = r#"{"name": "resource", "doc": {"uid": "x"}}"#;
        assert!(matches!(
            Document::from_json(unknown),
            Err(BridgeError::InvalidDocument(_))
        ));

        let negative = r#"{"name": "stop", "doc": {"uid": "s", "run_start": "r",
            "time": -3.0, "exit_status": "success"}}"#;
        assert!(matches!(
            Document::from_json(negative),
            Err(BridgeError::InvalidDocument(_))
        ));
    }

    #[test]
    fn test_stop_doc_totals() {
        let stop = StopDoc::success("r1")
            .with_num_events("primary", 3)
            .with_num_events("baseline", 2);

        assert_eq!(stop.exit_status, ExitStatus::Success);
        assert_eq!(stop.total_events(), 5);

        let json = serde_json::to_value(Document::Stop(stop)).unwrap();
        assert_eq!(json["name"], "stop");
        assert_eq!(json["doc"]["exit_status"], "success");
    }
}
