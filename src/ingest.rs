//! Document sequencing.
//!
//! The ingestor sees every document in emission order and decides which run it
//! belongs to. It tracks only run lifecycle and the descriptor → run index; it
//! buffers no documents.

use bridge_core::{BridgeError, BridgeResult, Document};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// A document accepted for a currently Active run.
#[derive(Debug, Clone, PartialEq)]
pub struct Admitted {
    /// Run the document belongs to
    pub run_id: String,
    /// The document
    pub document: Document,
}

/// Per-run lifecycle as the ingestor sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunPhase {
    Active,
    Closed,
}

/// Validates document order and opens/closes run lifecycle.
#[derive(Debug, Default)]
pub struct Ingestor {
    runs: HashMap<String, RunPhase>,
    /// descriptor uid -> run id, for Active runs
    descriptors: HashMap<String, String>,
    /// descriptors of each Active run, to drop the index entries on close
    run_descriptors: HashMap<String, HashSet<String>>,
}

impl Ingestor {
    /// Create an ingestor with no known runs
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `run_id` is currently Active
    pub fn is_active(&self, run_id: &str) -> bool {
        self.runs.get(run_id) == Some(&RunPhase::Active)
    }

    /// Number of Active runs
    pub fn active_runs(&self) -> usize {
        self.runs.values().filter(|p| **p == RunPhase::Active).count()
    }

    /// Admit one document.
    ///
    /// `start` opens a new Active run; every other document must belong to an
    /// Active run or fails with `Sequence`. A `stop` closes its run.
    pub fn admit(&mut self, document: Document) -> BridgeResult<Admitted> {
        document.validate()?;
        let run_id = match &document {
            Document::Start(start) => {
                if self.runs.contains_key(&start.uid) {
                    return Err(BridgeError::sequence(
                        start.uid.clone(),
                        "start for a run id that was already used",
                    ));
                }
                self.runs.insert(start.uid.clone(), RunPhase::Active);
                self.run_descriptors.insert(start.uid.clone(), HashSet::new());
                info!(run_id = %start.uid, plan = %start.plan_name, "Run started");
                start.uid.clone()
            }
            Document::Descriptor(desc) => {
                self.require_active(&desc.run_start, "descriptor")?;
                self.descriptors
                    .insert(desc.uid.clone(), desc.run_start.clone());
                if let Some(set) = self.run_descriptors.get_mut(&desc.run_start) {
                    set.insert(desc.uid.clone());
                }
                debug!(run_id = %desc.run_start, descriptor = %desc.uid, stream = %desc.name, "Descriptor admitted");
                desc.run_start.clone()
            }
            Document::Event(event) => {
                let run_id = match (event.run_start.as_ref(), self.descriptors.get(&event.descriptor)) {
                    (Some(claimed), Some(owner)) if claimed != owner => {
                        return Err(BridgeError::sequence(
                            claimed.clone(),
                            format!(
                                "event {} references descriptor {} of run {}",
                                event.uid, event.descriptor, owner
                            ),
                        ));
                    }
                    (_, Some(owner)) => owner.clone(),
                    (Some(claimed), None) => {
                        self.require_active(claimed, "event")?;
                        return Err(BridgeError::sequence(
                            claimed.clone(),
                            format!("event {} references unknown descriptor {}", event.uid, event.descriptor),
                        ));
                    }
                    (None, None) => {
                        return Err(BridgeError::sequence(
                            String::new(),
                            format!(
                                "event {} references descriptor {} of no active run",
                                event.uid, event.descriptor
                            ),
                        ));
                    }
                };
                self.require_active(&run_id, "event")?;
                run_id
            }
            Document::Stop(stop) => {
                self.require_active(&stop.run_start, "stop")?;
                self.close(&stop.run_start);
                info!(run_id = %stop.run_start, exit_status = %stop.exit_status, "Run stopped");
                stop.run_start.clone()
            }
        };
        Ok(Admitted { run_id, document })
    }

    /// Mark a run Closed without a stop document (forced failure, failed open).
    pub fn abandon(&mut self, run_id: &str) {
        if self.runs.contains_key(run_id) {
            self.close(run_id);
        }
    }

    fn close(&mut self, run_id: &str) {
        self.runs.insert(run_id.to_string(), RunPhase::Closed);
        if let Some(descriptors) = self.run_descriptors.remove(run_id) {
            for uid in descriptors {
                self.descriptors.remove(&uid);
            }
        }
    }

    fn require_active(&self, run_id: &str, kind: &str) -> BridgeResult<()> {
        match self.runs.get(run_id) {
            Some(RunPhase::Active) => Ok(()),
            Some(RunPhase::Closed) => Err(BridgeError::sequence(
                run_id,
                format!("{} for a closed run", kind),
            )),
            None => Err(BridgeError::sequence(
                run_id,
                format!("{} without a start document", kind),
            )),
        }
    }
}
