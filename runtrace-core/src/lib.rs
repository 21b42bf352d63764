//! # RunTrace Core
//!
//! Core primitives for instrumenting a callable with run tracking.
//!
//! This crate provides:
//! - Argument values and call records ([`value`])
//! - Declared-signature introspection ([`signature`])
//! - Tracking backend and run handle seams ([`backend`])
//! - Supporting artifact uploads ([`artifact`])
//! - The per-argument reporting pass ([`reporting`])
//! - The instrumentation wrapper and run lifecycle ([`instrument`])
//! - An in-memory recording backend for tests ([`mock`])
//!
//! The on-disk backend lives in the `runtrace` crate; everything here is
//! storage-agnostic.

#![forbid(unsafe_code)]

pub mod artifact;
pub mod backend;
pub mod instrument;
pub mod mock;
pub mod observe;
pub mod reporting;
pub mod signature;
pub mod value;

pub use artifact::{default_artifacts, ArtifactSpec, ArtifactUploadError};
pub use backend::{
    ArtifactBlob, ArtifactKind, BackendError, ChartSpec, ImageFormat, ImagePayload, RunHandle,
    RunRequest, RunStatus, TrackingBackend,
};
pub use instrument::{
    instrument, Callable, FnTask, InstrumentError, Instrumented, Instrumentor, RunSpec,
    SIGNATURE_CONFIG,
};
pub use observe::RunId;
pub use reporting::{report, Branch, ReportAssets, ReportEmissionError, ReportSummary};
pub use signature::{
    describe, describe_or_empty, IntrospectionError, ParameterDescriptor, ParameterKind, Signature,
};
pub use value::{ArgValue, CallArgs};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::backend::{RunHandle, TrackingBackend};
    pub use crate::instrument::{instrument, Callable, FnTask, InstrumentError, RunSpec};
    pub use crate::signature::{ParameterKind, Signature};
    pub use crate::value::{ArgValue, CallArgs};
}
