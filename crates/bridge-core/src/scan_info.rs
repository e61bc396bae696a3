//! Scan metadata published alongside the channels.
//!
//! Built from the start document, extended as channels are created, and
//! completed from the stop document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::experiment::document::{StartDoc, StopDoc};
use crate::model::{ChannelSchema, ScanOutcome};

/// Device group of the implicit time channel
pub const TIMER_DEVICE: &str = "timer";
/// Device group of detector channels and unclassified channels
pub const COUNTERS_DEVICE: &str = "counters";
/// Device group of motor channels
pub const AXIS_DEVICE: &str = "axis";

/// Defaults applied when the start document leaves a field out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanDefaults {
    /// Scan name when `plan_name` is empty
    pub name: String,
    /// Scan number when `scan_id` is absent
    pub number: i64,
    /// Session name
    pub session_name: String,
    /// Data policy when `data_policy` is absent
    pub data_policy: String,
    /// Planned points when `num_points` is absent
    pub npoints: u64,
    /// Count time per point, seconds
    pub count_time: f64,
}

impl Default for ScanDefaults {
    fn default() -> Self {
        Self {
            name: "my_scan".to_string(),
            number: 1,
            session_name: "sim_session".to_string(),
            data_policy: "no_policy".to_string(),
            npoints: 1000,
            count_time: 1.0,
        }
    }
}

/// Channels grouped under one device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device name
    pub name: String,
    /// Channel names in creation order
    pub channels: Vec<String>,
}

/// Per-channel display metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// Device group
    pub device: String,
    /// Number of dimensions
    pub dim: usize,
    /// Label shown by clients
    pub display_name: String,
    /// Element dtype
    pub dtype: String,
    /// Physical units
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

/// Channels driven by the top master
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MasterInfo {
    /// Scalar master channels
    pub scalars: Vec<String>,
    /// 1D master channels
    pub spectra: Vec<String>,
    /// 2D master channels
    pub images: Vec<String>,
}

/// One acquisition chain
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainInfo {
    /// Top master device
    pub top_master: String,
    /// Devices in the chain
    pub devices: Vec<String>,
    /// Scalar channels
    pub scalars: Vec<String>,
    /// 1D channels
    pub spectra: Vec<String>,
    /// 2D channels
    pub images: Vec<String>,
    /// Master channels
    pub master: MasterInfo,
}

/// One plotted curve or scatter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlotItem {
    /// "curve" or "scatter"
    pub kind: String,
    /// X axis channel
    pub x: String,
    /// Y axis channel
    pub y: String,
    /// Value channel of a scatter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Default plot of a scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlotInfo {
    /// "curve-plot" or "scatter-plot"
    pub kind: String,
    /// Display name
    pub name: String,
    /// Plotted items
    pub items: Vec<PlotItem>,
}

/// Completion info added on stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndInfo {
    /// ISO-8601 end time
    pub end_time: String,
    /// Exit status as reported, or "fail" when the bridge failed the scan
    pub exit_status: String,
    /// "SUCCESS" or "ERROR"
    pub end_reason: String,
    /// Total events
    pub num_events: u64,
    /// Reason text
    pub reason: String,
}

/// Scan metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanInfo {
    /// Run id
    pub uid: String,
    /// Scan name (the plan name)
    pub name: String,
    /// Scan number
    pub scan_nb: i64,
    /// Session name
    pub session_name: String,
    /// Data policy
    pub data_policy: String,
    /// Catalog metadata from the start document
    pub catalog_data: Value,
    /// ISO-8601 start time
    pub start_time: String,
    /// Scan type (the plan name)
    #[serde(rename = "type")]
    pub scan_type: String,
    /// Planned number of points
    pub npoints: u64,
    /// Count time per point
    pub count_time: f64,
    /// Title: name followed by the scan number
    pub title: String,
    /// Always "bluesky"
    pub user_name: String,
    /// Motor names
    pub motors: Vec<String>,
    /// Detector names
    pub detectors: Vec<String>,
    /// Acquisition chains keyed by name
    pub acquisition_chain: BTreeMap<String, ChainInfo>,
    /// Devices keyed by group
    pub devices: BTreeMap<String, DeviceInfo>,
    /// Channels keyed by name
    pub channels: BTreeMap<String, ChannelInfo>,
    /// Default plots
    pub plots: Vec<PlotInfo>,
    /// Grid start position per motor
    pub start: Vec<Value>,
    /// Grid stop position per motor
    pub stop: Vec<Value>,
    /// Remaining start document metadata
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    /// Set once the scan is closed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<EndInfo>,
}

impl ScanInfo {
    /// Build the initial info of a scan from its start document.
    pub fn from_start(start: &StartDoc, defaults: &ScanDefaults) -> Self {
        let name = if start.plan_name.is_empty() {
            defaults.name.clone()
        } else {
            start.plan_name.clone()
        };
        let scan_nb = start.scan_id.unwrap_or(defaults.number);
        let motors = start.motors.clone().unwrap_or_default();

        let mut grid_start = Vec::new();
        let mut grid_stop = Vec::new();
        if is_grid(&name) {
            // plan_args.args holds [motor, start, stop, num] per motor; older
            // plans omit num
            let args = start
                .plan_args
                .get("args")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let stride = if args.len() >= motors.len() * 4 { 4 } else { 3 };
            for chunk in args.chunks(stride).take(motors.len()) {
                if let (Some(lo), Some(hi)) = (chunk.get(1), chunk.get(2)) {
                    grid_start.push(lo.clone());
                    grid_stop.push(hi.clone());
                }
            }
        }

        let devices = [TIMER_DEVICE, COUNTERS_DEVICE, AXIS_DEVICE]
            .iter()
            .map(|d| {
                (
                    d.to_string(),
                    DeviceInfo {
                        name: d.to_string(),
                        channels: Vec::new(),
                    },
                )
            })
            .collect();

        let mut info = Self {
            uid: start.uid.clone(),
            title: format!("{}{}", name, scan_nb),
            scan_type: name.clone(),
            name,
            scan_nb,
            session_name: defaults.session_name.clone(),
            data_policy: start
                .data_policy
                .clone()
                .unwrap_or_else(|| defaults.data_policy.clone()),
            catalog_data: start.meta_catalog.clone(),
            start_time: iso_time(start.time),
            npoints: start.num_points.unwrap_or(defaults.npoints),
            count_time: defaults.count_time,
            user_name: "bluesky".to_string(),
            motors,
            detectors: start.detectors.clone().unwrap_or_default(),
            acquisition_chain: BTreeMap::new(),
            devices,
            channels: BTreeMap::new(),
            plots: Vec::new(),
            start: grid_start,
            stop: grid_stop,
            metadata: start.metadata.clone(),
            end: None,
        };
        info.rebuild_derived();
        info
    }

    /// Device group for a channel name: motors → axis, everything else → counters.
    pub fn device_for(&self, channel: &str) -> &'static str {
        if self.motors.iter().any(|m| m == channel) {
            AXIS_DEVICE
        } else {
            COUNTERS_DEVICE
        }
    }

    /// Whether the scan is a grid scan (scatter plots, grid positions)
    pub fn is_grid(&self) -> bool {
        is_grid(&self.name)
    }

    /// Register a newly created channel.
    pub fn add_channel(&mut self, schema: &ChannelSchema) {
        if self.channels.contains_key(&schema.name) {
            return;
        }
        let device = if schema.device.is_empty() {
            self.device_for(&schema.name).to_string()
        } else {
            schema.device.clone()
        };
        self.devices
            .entry(device.clone())
            .or_insert_with(|| DeviceInfo {
                name: device.clone(),
                channels: Vec::new(),
            })
            .channels
            .push(schema.name.clone());
        self.channels.insert(
            schema.name.clone(),
            ChannelInfo {
                device,
                dim: schema.shape.len(),
                display_name: schema.name.clone(),
                dtype: schema.dtype.to_string(),
                unit: schema.units.clone(),
            },
        );
        self.rebuild_derived();
    }

    /// Record completion from a stop document.
    pub fn finish(&mut self, stop: &StopDoc) {
        let outcome = ScanOutcome::from(stop.exit_status);
        self.end = Some(EndInfo {
            end_time: iso_time(stop.time),
            exit_status: stop.exit_status.to_string(),
            end_reason: outcome.end_reason().to_string(),
            num_events: stop.total_events(),
            reason: stop.reason.clone(),
        });
    }

    /// Record completion forced by the bridge (schema conflict, storage failure).
    pub fn fail(&mut self, time: f64, num_events: u64, reason: &str) {
        self.end = Some(EndInfo {
            end_time: iso_time(time),
            exit_status: "fail".to_string(),
            end_reason: ScanOutcome::Failed.end_reason().to_string(),
            num_events,
            reason: reason.to_string(),
        });
    }

    fn rebuild_derived(&mut self) {
        let channels_of = |device: &str| -> Vec<&String> {
            self.devices
                .get(device)
                .map(|d| d.channels.iter().collect())
                .unwrap_or_default()
        };

        let mut chain = ChainInfo {
            top_master: TIMER_DEVICE.to_string(),
            devices: self.devices.keys().cloned().collect(),
            ..ChainInfo::default()
        };
        for device in self.devices.keys().filter(|d| d.as_str() != TIMER_DEVICE) {
            for name in channels_of(device) {
                let dim = self.channels.get(name).map(|c| c.dim).unwrap_or(0);
                match dim {
                    0 => chain.scalars.push(name.clone()),
                    1 => chain.spectra.push(name.clone()),
                    _ => chain.images.push(name.clone()),
                }
            }
        }
        chain.master.scalars = channels_of(TIMER_DEVICE).into_iter().cloned().collect();
        self.acquisition_chain.clear();
        self.acquisition_chain.insert(AXIS_DEVICE.to_string(), chain);

        let x_axis = self
            .motors
            .first()
            .cloned()
            .unwrap_or_else(|| "time".to_string());
        let counters: Vec<String> = channels_of(COUNTERS_DEVICE)
            .into_iter()
            .filter(|c| self.channels.get(*c).map(|i| i.dim == 0).unwrap_or(false))
            .cloned()
            .collect();

        let plot = if self.is_grid() && self.motors.len() >= 2 {
            PlotInfo {
                kind: "scatter-plot".to_string(),
                name: "Scatter-Plot".to_string(),
                items: counters
                    .into_iter()
                    .map(|value| PlotItem {
                        kind: "scatter".to_string(),
                        x: self.motors[0].clone(),
                        y: self.motors[1].clone(),
                        value: Some(value),
                    })
                    .collect(),
            }
        } else {
            PlotInfo {
                kind: "curve-plot".to_string(),
                name: "Curve-Plot".to_string(),
                items: counters
                    .into_iter()
                    .filter(|y| *y != x_axis)
                    .map(|y| PlotItem {
                        kind: "curve".to_string(),
                        x: x_axis.clone(),
                        y,
                        value: None,
                    })
                    .collect(),
            }
        };
        self.plots = vec![plot];
    }
}

fn is_grid(name: &str) -> bool {
    name.to_lowercase().contains("grid")
}

/// ISO-8601 rendering of seconds since the epoch.
pub fn iso_time(secs: f64) -> String {
    let whole = secs.floor();
    let nanos = ((secs - whole) * 1e9).round().min(999_999_999.0) as u32;
    DateTime::<Utc>::from_timestamp(whole as i64, nanos)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DType;
    use serde_json::json;

    fn channel(name: &str, device: &str) -> ChannelSchema {
        ChannelSchema {
            device: device.to_string(),
            ..ChannelSchema::scalar(name, DType::Float64)
        }
    }

    #[test]
    fn test_defaults_fill_missing_fields() {
        let start = StartDoc::new("").with_uid("r1");
        let info = ScanInfo::from_start(&start, &ScanDefaults::default());

        assert_eq!(info.name, "my_scan");
        assert_eq!(info.scan_nb, 1);
        assert_eq!(info.npoints, 1000);
        assert_eq!(info.title, "my_scan1");
        assert_eq!(info.user_name, "bluesky");
        assert_eq!(info.devices.len(), 3);
    }

    #[test]
    fn test_grid_positions_from_plan_args() {
        let start = StartDoc::new("grid_scan")
            .with_motor("m1")
            .with_motor("m2")
            .with_plan_args(json!({"args": ["m1", -1.0, 1.0, 3, "m2", 0.0, 2.0, 5]}));
        let info = ScanInfo::from_start(&start, &ScanDefaults::default());

        assert!(info.is_grid());
        assert_eq!(info.start, vec![json!(-1.0), json!(0.0)]);
        assert_eq!(info.stop, vec![json!(1.0), json!(2.0)]);
    }

    #[test]
    fn test_channels_update_chain_and_plots() {
        let start = StartDoc::new("scan").with_motor("m1").with_detector("det1");
        let mut info = ScanInfo::from_start(&start, &ScanDefaults::default());
        info.add_channel(&channel("time", TIMER_DEVICE));
        info.add_channel(&channel("m1", AXIS_DEVICE));
        info.add_channel(&channel("det1", COUNTERS_DEVICE));

        let chain = &info.acquisition_chain["axis"];
        assert_eq!(chain.top_master, "timer");
        assert_eq!(chain.master.scalars, vec!["time".to_string()]);
        assert!(chain.scalars.contains(&"det1".to_string()));

        let plot = &info.plots[0];
        assert_eq!(plot.kind, "curve-plot");
        assert_eq!(plot.items[0].x, "m1");
        assert_eq!(plot.items[0].y, "det1");
    }

    #[test]
    fn test_finish_records_end_info() {
        let start = StartDoc::new("count").with_uid("r1");
        let mut info = ScanInfo::from_start(&start, &ScanDefaults::default());
        let stop = StopDoc::abort("r1", "operator").with_num_events("primary", 4);
        info.finish(&stop);

        let end = info.end.as_ref().unwrap();
        assert_eq!(end.exit_status, "abort");
        assert_eq!(end.end_reason, "ERROR");
        assert_eq!(end.num_events, 4);
    }

    #[test]
    fn test_iso_time() {
        assert_eq!(iso_time(0.0), "1970-01-01T00:00:00+00:00");
    }
}
