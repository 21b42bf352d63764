//! In-memory recording backend
//!
//! Captures every handle call in order so tests (and downstream users) can
//! assert on the exact report stream of a run without touching disk.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::backend::{
    ArtifactBlob, ArtifactKind, BackendError, ChartSpec, ImageFormat, ImagePayload, RunHandle,
    RunRequest, RunStatus, TrackingBackend,
};
use crate::observe::{unix_nanos_now, RunId};

/// Handle operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Configuration,
    Artifact,
    Scalar,
    Text,
    Image,
    Chart,
    Finalize,
}

/// One recorded handle call.
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Configuration {
        name: String,
        config: serde_json::Value,
    },
    Artifact {
        name: String,
        kind: ArtifactKind,
        bytes: usize,
    },
    Scalar {
        title: String,
        series: String,
        value: f64,
        x: f64,
    },
    Text(String),
    Image {
        title: String,
        series: String,
        x: f64,
        format: ImageFormat,
    },
    Chart {
        title: String,
        series: String,
        x: f64,
        figure: serde_json::Value,
    },
    Finalized(RunStatus),
}

/// Snapshot of one run's request and call log.
#[derive(Debug, Clone)]
pub struct RecordedRun {
    pub run_id: RunId,
    pub request: RunRequest,
    pub events: Vec<Recorded>,
}

impl RecordedRun {
    /// `(value, x)` pairs reported on `series`, in order.
    pub fn scalars(&self, series: &str) -> Vec<(f64, f64)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Recorded::Scalar {
                    series: s,
                    value,
                    x,
                    ..
                } if s == series => Some((*value, *x)),
                _ => None,
            })
            .collect()
    }

    pub fn texts(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Recorded::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn images(&self) -> usize {
        self.count(|e| matches!(e, Recorded::Image { .. }))
    }

    pub fn charts(&self) -> usize {
        self.count(|e| matches!(e, Recorded::Chart { .. }))
    }

    pub fn artifacts(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Recorded::Artifact { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn configuration(&self, name: &str) -> Option<&serde_json::Value> {
        self.events.iter().find_map(|e| match e {
            Recorded::Configuration { name: n, config } if n == name => Some(config),
            _ => None,
        })
    }

    /// Statuses passed to finalize (one entry per successful call).
    pub fn finalizations(&self) -> Vec<RunStatus> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Recorded::Finalized(status) => Some(*status),
                _ => None,
            })
            .collect()
    }

    /// Number of report calls (scalar, text, image, chart).
    pub fn reports(&self) -> usize {
        self.count(|e| {
            matches!(
                e,
                Recorded::Scalar { .. }
                    | Recorded::Text(_)
                    | Recorded::Image { .. }
                    | Recorded::Chart { .. }
            )
        })
    }

    fn count(&self, pred: impl Fn(&Recorded) -> bool) -> usize {
        self.events.iter().filter(|e| pred(e)).count()
    }
}

#[derive(Debug)]
struct RunLog {
    run_id: RunId,
    request: RunRequest,
    events: Mutex<Vec<Recorded>>,
}

impl RunLog {
    fn events(&self) -> MutexGuard<'_, Vec<Recorded>> {
        // A poisoned log still holds every event pushed before the panic.
        self.events.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Backend that records runs in memory.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    unavailable: bool,
    failing: HashSet<Operation>,
    runs: Mutex<Vec<Arc<RunLog>>>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `open_run` fail with [`BackendError::Unavailable`].
    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    /// Make every call of `op` fail with [`BackendError::Rejected`].
    pub fn failing(mut self, op: Operation) -> Self {
        self.failing.insert(op);
        self
    }

    /// Snapshot of all runs opened so far, in open order.
    pub fn runs(&self) -> Vec<RecordedRun> {
        let runs = self.runs.lock().unwrap_or_else(|p| p.into_inner());
        runs.iter()
            .map(|log| RecordedRun {
                run_id: log.run_id,
                request: log.request.clone(),
                events: log.events().clone(),
            })
            .collect()
    }

    /// Snapshot of the most recently opened run.
    pub fn last_run(&self) -> Option<RecordedRun> {
        self.runs().pop()
    }
}

impl TrackingBackend for RecordingBackend {
    type Handle = RecordingHandle;

    fn open_run(&self, request: &RunRequest) -> Result<Self::Handle, BackendError> {
        if self.unavailable {
            return Err(BackendError::Unavailable(
                "recording backend configured as unavailable".to_string(),
            ));
        }
        let log = Arc::new(RunLog {
            run_id: RunId::derive(&request.project, &request.name, unix_nanos_now()),
            request: request.clone(),
            events: Mutex::new(Vec::new()),
        });
        self.runs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(Arc::clone(&log));
        Ok(RecordingHandle {
            log,
            failing: self.failing.clone(),
            closed: AtomicBool::new(false),
        })
    }
}

/// Handle produced by [`RecordingBackend`].
#[derive(Debug)]
pub struct RecordingHandle {
    log: Arc<RunLog>,
    failing: HashSet<Operation>,
    closed: AtomicBool,
}

impl RecordingHandle {
    fn record(&self, op: Operation, event: Recorded) -> Result<(), BackendError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BackendError::Closed(self.log.run_id));
        }
        if self.failing.contains(&op) {
            return Err(BackendError::Rejected {
                operation: operation_name(op),
                reason: "injected failure".to_string(),
            });
        }
        self.log.events().push(event);
        Ok(())
    }
}

fn operation_name(op: Operation) -> &'static str {
    match op {
        Operation::Configuration => "attach_configuration",
        Operation::Artifact => "upload_artifact",
        Operation::Scalar => "report_scalar",
        Operation::Text => "report_text",
        Operation::Image => "report_image",
        Operation::Chart => "report_chart",
        Operation::Finalize => "finalize",
    }
}

impl RunHandle for RecordingHandle {
    fn run_id(&self) -> RunId {
        self.log.run_id
    }

    fn attach_configuration(
        &self,
        name: &str,
        config: &serde_json::Value,
    ) -> Result<(), BackendError> {
        self.record(
            Operation::Configuration,
            Recorded::Configuration {
                name: name.to_string(),
                config: config.clone(),
            },
        )
    }

    fn upload_artifact(&self, artifact: &ArtifactBlob) -> Result<(), BackendError> {
        self.record(
            Operation::Artifact,
            Recorded::Artifact {
                name: artifact.name.clone(),
                kind: artifact.kind,
                bytes: artifact.bytes.len(),
            },
        )
    }

    fn report_scalar(
        &self,
        title: &str,
        series: &str,
        value: f64,
        x: f64,
    ) -> Result<(), BackendError> {
        self.record(
            Operation::Scalar,
            Recorded::Scalar {
                title: title.to_string(),
                series: series.to_string(),
                value,
                x,
            },
        )
    }

    fn report_text(&self, text: &str) -> Result<(), BackendError> {
        self.record(Operation::Text, Recorded::Text(text.to_string()))
    }

    fn report_image(
        &self,
        title: &str,
        series: &str,
        x: f64,
        image: &ImagePayload,
    ) -> Result<(), BackendError> {
        self.record(
            Operation::Image,
            Recorded::Image {
                title: title.to_string(),
                series: series.to_string(),
                x,
                format: image.format,
            },
        )
    }

    fn report_chart(
        &self,
        title: &str,
        series: &str,
        x: f64,
        chart: &ChartSpec,
    ) -> Result<(), BackendError> {
        self.record(
            Operation::Chart,
            Recorded::Chart {
                title: title.to_string(),
                series: series.to_string(),
                x,
                figure: chart.figure.clone(),
            },
        )
    }

    fn finalize(&self, status: RunStatus) -> Result<(), BackendError> {
        self.record(Operation::Finalize, Recorded::Finalized(status))?;
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
