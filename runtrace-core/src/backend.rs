//! Tracking backend seams.
//!
//! A [`TrackingBackend`] registers runs and hands out one [`RunHandle`] per
//! run. The handle is the only capability the instrumentation wrapper and the
//! reporting pass use; storage, querying and visualization are the backend's
//! business.

use std::io;
use std::sync::Arc;

use crate::observe::RunId;

/// Errors surfaced by a tracking backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The backend cannot be reached; no run exists.
    #[error("tracking backend unavailable: {0}")]
    Unavailable(String),
    /// The run was already finalized.
    #[error("run {0} is already finalized")]
    Closed(RunId),
    /// The backend refused the request.
    #[error("backend rejected {operation}: {reason}")]
    Rejected {
        operation: &'static str,
        reason: String,
    },
    #[error("backend i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Parameters used to register a run.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RunRequest {
    pub project: String,
    pub name: String,
    pub tags: Vec<String>,
}

/// Terminal status recorded at finalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

/// Artifact payload classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Image,
    File,
}

/// A named artifact blob uploaded as run metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactBlob {
    pub name: String,
    pub kind: ArtifactKind,
    /// Original file name (used for the stored extension).
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Image encodings accepted as image payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageFormat {
    Jpeg,
    Png,
}

impl ImageFormat {
    /// Detect the format from the leading signature bytes.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        const JPEG: &[u8] = &[0xff, 0xd8, 0xff];
        const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
        if bytes.starts_with(JPEG) {
            Some(ImageFormat::Jpeg)
        } else if bytes.starts_with(PNG) {
            Some(ImageFormat::Png)
        } else {
            None
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
        }
    }
}

/// An encoded image reported as a debug sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub format: ImageFormat,
    pub bytes: Vec<u8>,
}

impl ImagePayload {
    /// Wrap encoded bytes, returning `None` when they are not a known image.
    pub fn from_bytes(bytes: Vec<u8>) -> Option<Self> {
        let format = ImageFormat::sniff(&bytes)?;
        Some(Self { format, bytes })
    }
}

/// A chart figure in Plotly-compatible JSON form.
#[derive(Debug, Clone, PartialEq)]
pub struct ChartSpec {
    pub figure: serde_json::Value,
}

impl ChartSpec {
    /// A single-trace pie chart.
    pub fn pie<L, V>(labels: L, values: V) -> Self
    where
        L: IntoIterator,
        L::Item: Into<String>,
        V: IntoIterator<Item = f64>,
    {
        let labels: Vec<String> = labels.into_iter().map(Into::into).collect();
        let values: Vec<f64> = values.into_iter().collect();
        Self {
            figure: serde_json::json!({
                "data": [{ "type": "pie", "labels": labels, "values": values }],
                "layout": {},
            }),
        }
    }
}

/// Capability object for one run.
///
/// A handle is owned by exactly one invocation. Implementations serialize
/// their own writes, so every method takes `&self`.
pub trait RunHandle: Send {
    /// Backend-assigned identity.
    fn run_id(&self) -> RunId;

    /// Attach a named configuration blob.
    fn attach_configuration(
        &self,
        name: &str,
        config: &serde_json::Value,
    ) -> Result<(), BackendError>;

    /// Upload a named artifact.
    fn upload_artifact(&self, artifact: &ArtifactBlob) -> Result<(), BackendError>;

    /// Append a scalar point to the `(title, series)` series.
    fn report_scalar(&self, title: &str, series: &str, value: f64, x: f64)
        -> Result<(), BackendError>;

    /// Append a console text line.
    fn report_text(&self, text: &str) -> Result<(), BackendError>;

    /// Report an image debug sample.
    fn report_image(
        &self,
        title: &str,
        series: &str,
        x: f64,
        image: &ImagePayload,
    ) -> Result<(), BackendError>;

    /// Report a chart.
    fn report_chart(
        &self,
        title: &str,
        series: &str,
        x: f64,
        chart: &ChartSpec,
    ) -> Result<(), BackendError>;

    /// Terminal signal; releases backend resources.
    fn finalize(&self, status: RunStatus) -> Result<(), BackendError>;
}

/// A backend that registers runs.
pub trait TrackingBackend: Send + Sync {
    type Handle: RunHandle;

    /// Register a run and open its handle.
    ///
    /// Returns [`BackendError::Unavailable`] when the backend cannot be reached.
    fn open_run(&self, request: &RunRequest) -> Result<Self::Handle, BackendError>;
}

impl<B: TrackingBackend + ?Sized> TrackingBackend for &B {
    type Handle = B::Handle;

    fn open_run(&self, request: &RunRequest) -> Result<Self::Handle, BackendError> {
        (**self).open_run(request)
    }
}

impl<B: TrackingBackend + ?Sized> TrackingBackend for Arc<B> {
    type Handle = B::Handle;

    fn open_run(&self, request: &RunRequest) -> Result<Self::Handle, BackendError> {
        (**self).open_run(request)
    }
}
