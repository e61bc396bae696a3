//! Document → scan/channel/sample translation.
//!
//! One [`ScanTranslator`] per run turns admitted documents into an ordered list
//! of [`WriteOp`]s. Translation is deterministic: for the same document sequence
//! it produces the same channel creations and samples in the same order.
//!
//! - descriptor → channel creations (implicit `time` channel first, then data
//!   keys in name order)
//! - event → one sample per data key (name order), then the `time` sample
//! - stop → scan close with the reported outcome

use bridge_core::scan_info::{AXIS_DEVICE, COUNTERS_DEVICE, TIMER_DEVICE};
use bridge_core::{
    BridgeError, BridgeResult, ChannelSchema, DType, DataKey, DescriptorDoc, Document, EventDoc,
    Sample, SampleValue, ScanDefaults, ScanInfo, ScanOutcome, StartDoc, StopDoc,
};
use std::collections::{BTreeMap, HashMap};

/// Name of the implicit per-event time channel
pub const TIME_CHANNEL: &str = "time";

/// One mutation of the stream store.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Open the scan
    OpenScan(ScanInfo),
    /// Create a channel
    CreateChannel(ChannelSchema),
    /// Append a sample
    Append {
        /// Channel name
        channel: String,
        /// Sample with its assigned sequence number
        sample: Sample,
    },
    /// Close the scan
    Close {
        /// Outcome
        outcome: ScanOutcome,
        /// Reason text
        reason: String,
        /// Stop document, with `num_events` filled in
        stop: StopDoc,
    },
}

/// Translation state of one run.
#[derive(Debug)]
pub struct ScanTranslator {
    run_id: String,
    motors: Vec<String>,
    channels: HashMap<String, ChannelSchema>,
    next_seq: HashMap<String, u64>,
    /// descriptor uid -> stream name
    descriptors: HashMap<String, String>,
    /// events per stream name
    events: BTreeMap<String, u64>,
    implicit_time: bool,
    closed: bool,
}

impl ScanTranslator {
    /// Start translating a run. Returns the translator and the `OpenScan` op.
    pub fn start(start: &StartDoc, defaults: &ScanDefaults) -> (Self, WriteOp) {
        let info = ScanInfo::from_start(start, defaults);
        let translator = Self {
            run_id: start.uid.clone(),
            motors: info.motors.clone(),
            channels: HashMap::new(),
            next_seq: HashMap::new(),
            descriptors: HashMap::new(),
            events: BTreeMap::new(),
            implicit_time: false,
            closed: false,
        };
        (translator, WriteOp::OpenScan(info))
    }

    /// Run id
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Events translated so far, over all streams
    pub fn total_events(&self) -> u64 {
        self.events.values().sum()
    }

    /// Whether the scan was closed (by stop or by a fatal error)
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Stop accepting documents after a forced close.
    pub fn mark_closed(&mut self) {
        self.closed = true;
    }

    /// Translate one document of this run.
    pub fn translate(&mut self, document: &Document) -> BridgeResult<Vec<WriteOp>> {
        if self.closed {
            return Err(BridgeError::sequence(
                self.run_id.clone(),
                format!("{} for a closed scan", document.kind()),
            ));
        }
        match document {
            Document::Start(_) => Err(BridgeError::sequence(
                self.run_id.clone(),
                "second start document for an active scan",
            )),
            Document::Descriptor(desc) => self.descriptor(desc),
            Document::Event(event) => self.event(event),
            Document::Stop(stop) => Ok(self.stop(stop)),
        }
    }

    fn schema_for(&self, name: &str, key: &DataKey) -> ChannelSchema {
        let owner = key.object_name.as_deref();
        let is = |list: &[String]| list.iter().any(|n| n == name || Some(n.as_str()) == owner);
        let device = if is(&self.motors) {
            AXIS_DEVICE
        } else {
            COUNTERS_DEVICE
        };
        ChannelSchema {
            name: name.to_string(),
            dtype: DType::from_descriptor(&key.dtype, key.dtype_numpy.as_deref()),
            shape: key.shape.clone(),
            units: key.units.clone(),
            source: key.source.clone(),
            device: device.to_string(),
        }
    }

    fn descriptor(&mut self, desc: &DescriptorDoc) -> BridgeResult<Vec<WriteOp>> {
        let mut new_channels = Vec::new();

        if self.channels.is_empty() && !desc.data_keys.contains_key(TIME_CHANNEL) {
            new_channels.push(ChannelSchema {
                units: Some("s".to_string()),
                device: TIMER_DEVICE.to_string(),
                ..ChannelSchema::scalar(TIME_CHANNEL, DType::Float64)
            });
        }

        // data_keys is a BTreeMap: name order
        for (name, key) in &desc.data_keys {
            let schema = self.schema_for(name, key);
            match self.channels.get(name) {
                Some(existing) if existing.is_compatible(&schema) => {}
                Some(existing) => {
                    return Err(BridgeError::SchemaConflict {
                        run_id: self.run_id.clone(),
                        channel: name.clone(),
                        existing: existing.describe(),
                        requested: schema.describe(),
                    });
                }
                None => new_channels.push(schema),
            }
        }

        self.descriptors.insert(desc.uid.clone(), desc.name.clone());
        self.events.entry(desc.name.clone()).or_insert(0);

        let mut ops = Vec::with_capacity(new_channels.len());
        for schema in new_channels {
            if schema.name == TIME_CHANNEL && schema.device == TIMER_DEVICE {
                self.implicit_time = true;
            }
            self.next_seq.insert(schema.name.clone(), 0);
            self.channels.insert(schema.name.clone(), schema.clone());
            ops.push(WriteOp::CreateChannel(schema));
        }
        Ok(ops)
    }

    fn event(&mut self, event: &EventDoc) -> BridgeResult<Vec<WriteOp>> {
        let Some(stream) = self.descriptors.get(&event.descriptor).cloned() else {
            return Err(BridgeError::sequence(
                self.run_id.clone(),
                format!("event {} references unknown descriptor {}", event.uid, event.descriptor),
            ));
        };

        // Convert everything before assigning any sequence number so a bad
        // value rejects the whole event
        let mut values = Vec::with_capacity(event.data.len() + 1);
        for (name, value) in &event.data {
            let schema = self.channels.get(name).ok_or_else(|| BridgeError::UnknownChannel {
                run_id: self.run_id.clone(),
                channel: name.clone(),
            })?;
            let sample_value = SampleValue::from_json(schema, value)?;
            let timestamp = event.timestamps.get(name).copied().unwrap_or(event.time);
            values.push((name.clone(), timestamp, sample_value));
        }
        if self.implicit_time && !event.data.contains_key(TIME_CHANNEL) {
            values.push((
                TIME_CHANNEL.to_string(),
                event.time,
                SampleValue::Float(event.time),
            ));
        }

        let mut ops = Vec::with_capacity(values.len());
        for (channel, timestamp, value) in values {
            let seq = self.next_seq.entry(channel.clone()).or_insert(0);
            ops.push(WriteOp::Append {
                channel,
                sample: Sample::new(*seq, timestamp, value),
            });
            *seq += 1;
        }
        *self.events.entry(stream).or_insert(0) += 1;
        Ok(ops)
    }

    fn stop(&mut self, stop: &StopDoc) -> Vec<WriteOp> {
        self.closed = true;
        let mut stop = stop.clone();
        if stop.num_events.is_empty() {
            stop.num_events = self.events.clone();
        }
        vec![WriteOp::Close {
            outcome: ScanOutcome::from(stop.exit_status),
            reason: stop.reason.clone(),
            stop,
        }]
    }
}
