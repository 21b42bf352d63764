//! # RunTrace
//!
//! Run tracking for plain Rust callables. Wrapping a callable with
//! [`instrument`] opens a run on a tracking backend for every invocation,
//! records the callable's declared signature, uploads supporting artifacts,
//! calls the target and then reports every positional argument as a scalar,
//! an image or a chart before the run is finalized.
//!
//! ```rust,no_run
//! use runtrace::prelude::*;
//! use runtrace::{LocalBackend, ParameterDescriptor};
//!
//! let task = FnTask::new("process_data", |args: &CallArgs| {
//!     Ok::<_, std::convert::Infallible>(args.positional.len())
//! })
//! .with_params([
//!     ParameterDescriptor::new("args", ParameterKind::VarPositional),
//!     ParameterDescriptor::new("kwargs", ParameterKind::VarKeyword),
//! ]);
//!
//! let wrapped = instrument(RunSpec::new("Demo"), LocalBackend::new(".")).wrap(task);
//! let n = wrapped.invoke(&CallArgs::positional([1, 2, 3, 4])).unwrap();
//! assert_eq!(n, 4);
//! ```
//!
//! ## Crate Structure
//!
//! - [`runtrace_core`]: values, signatures, backend traits, reporting and the wrapper
//! - [`bundle`]: the on-disk run bundle backend
//! - [`config`]: INI task configuration
//! - [`logging`]: subscriber setup for binaries

#![forbid(unsafe_code)]

pub use runtrace_core as core;

pub use runtrace_core::{
    default_artifacts, describe, instrument, report, ArgValue, ArtifactSpec, BackendError, Branch,
    CallArgs, Callable, ChartSpec, FnTask, InstrumentError, Instrumented, Instrumentor,
    ParameterDescriptor, ParameterKind, ReportAssets, ReportSummary, RunHandle, RunId,
    RunRequest, RunSpec, RunStatus, Signature, TrackingBackend,
};

/// Local run bundle backend.
pub mod bundle;

/// INI task configuration.
pub mod config;

/// Log subscriber setup.
pub mod logging;

pub use crate::bundle::{LocalBackend, LocalRun, RunBundle};
pub use crate::config::{RuntraceConfig, TaskConfig};

/// Prelude module for convenient imports
///
/// ```rust,ignore
/// use runtrace::prelude::*;
/// ```
pub mod prelude {
    pub use crate::core::prelude::*;

    pub use crate::{LocalBackend, RuntraceConfig};
}
