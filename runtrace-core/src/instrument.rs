//! Instrumentation wrapper.
//!
//! `instrument(spec, backend).wrap(target)` produces a callable that, on every
//! invocation:
//! 1. resolves the run name (spec name, else the target's identifier)
//! 2. opens a run (backend unavailability is the only fatal error)
//! 3. attaches the target's signature as `function_signature`
//! 4. uploads the supporting artifacts (failures become console warnings)
//! 5. calls the target
//! 6. runs the reporting pass over the positional arguments
//! 7. finalizes the run on every exit path, unwinding included
//!
//! The wrapped callable is itself a [`Callable`], so wrapping composes.

use std::path::{Path, PathBuf};

use crate::artifact::{default_artifacts, upload_all, ArtifactSpec};
use crate::backend::{BackendError, RunHandle, RunRequest, RunStatus, TrackingBackend};
use crate::reporting::{report, ReportAssets};
use crate::signature::{describe_or_empty, IntrospectionError, ParameterDescriptor, Signature};
use crate::value::CallArgs;

/// Configuration name under which the signature is attached.
pub const SIGNATURE_CONFIG: &str = "function_signature";

/// A callable that can be instrumented.
pub trait Callable {
    type Output;
    type Error;

    /// Stable identifier (the function name).
    fn identifier(&self) -> &str;

    /// Declared parameters. Must not invoke the callable.
    fn signature(&self) -> Result<Signature, IntrospectionError>;

    fn call(&self, args: &CallArgs) -> Result<Self::Output, Self::Error>;
}

/// A closure with an explicit name and optional parameter declaration.
pub struct FnTask<F> {
    name: String,
    params: Option<Vec<ParameterDescriptor>>,
    func: F,
}

impl<F> FnTask<F> {
    /// A task without declared parameters (not introspectable).
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            params: None,
            func,
        }
    }

    /// Declare the task's parameters, in order.
    pub fn with_params(mut self, params: impl IntoIterator<Item = ParameterDescriptor>) -> Self {
        self.params = Some(params.into_iter().collect());
        self
    }
}

impl<F> core::fmt::Debug for FnTask<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FnTask")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl<F, T, E> Callable for FnTask<F>
where
    F: Fn(&CallArgs) -> Result<T, E>,
{
    type Output = T;
    type Error = E;

    fn identifier(&self) -> &str {
        &self.name
    }

    fn signature(&self) -> Result<Signature, IntrospectionError> {
        match &self.params {
            Some(params) => Signature::from_params(params.iter().cloned()),
            None => Err(IntrospectionError::NotIntrospectable(self.name.clone())),
        }
    }

    fn call(&self, args: &CallArgs) -> Result<T, E> {
        (self.func)(args)
    }
}

/// Static run parameters supplied at wrap time.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RunSpec {
    pub project: String,
    pub name: Option<String>,
    pub tags: Vec<String>,
}

impl RunSpec {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            name: None,
            tags: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// The spec's name, else `identifier`.
    pub fn effective_name(&self, identifier: &str) -> String {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => identifier.to_string(),
        }
    }
}

/// Errors surfaced by an instrumented call.
#[derive(Debug, thiserror::Error)]
pub enum InstrumentError<E> {
    /// No run could be opened; the target was not called.
    #[error(transparent)]
    Backend(BackendError),
    /// The target's own error, returned after the run was finalized.
    #[error("{0}")]
    Target(E),
}

impl<E> InstrumentError<E> {
    pub fn is_backend(&self) -> bool {
        matches!(self, InstrumentError::Backend(_))
    }

    /// The target's error, if that is what this is.
    pub fn into_target(self) -> Option<E> {
        match self {
            InstrumentError::Target(err) => Some(err),
            InstrumentError::Backend(_) => None,
        }
    }
}

/// Builder returned by [`instrument`].
#[derive(Debug, Clone)]
pub struct Instrumentor<B> {
    spec: RunSpec,
    backend: B,
    asset_dir: PathBuf,
    artifacts: Vec<ArtifactSpec>,
    /// Explicit report assets; derived from `asset_dir` at wrap time otherwise.
    report_assets: Option<ReportAssets>,
}

/// Start instrumenting callables with `spec` against `backend`.
pub fn instrument<B: TrackingBackend>(spec: RunSpec, backend: B) -> Instrumentor<B> {
    Instrumentor {
        spec,
        backend,
        asset_dir: PathBuf::from("./"),
        artifacts: default_artifacts(),
        report_assets: None,
    }
}

impl<B: TrackingBackend> Instrumentor<B> {
    /// Resolve artifacts, and report assets unless set explicitly, against `dir`.
    pub fn asset_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.asset_dir = dir.into();
        self
    }

    /// Replace the supporting artifact set.
    pub fn artifacts(mut self, artifacts: Vec<ArtifactSpec>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn report_assets(mut self, assets: ReportAssets) -> Self {
        self.report_assets = Some(assets);
        self
    }

    pub fn wrap<C: Callable>(self, target: C) -> Instrumented<C, B> {
        let report_assets = self
            .report_assets
            .unwrap_or_else(|| ReportAssets::new(&self.asset_dir));
        Instrumented {
            target,
            spec: self.spec,
            backend: self.backend,
            asset_dir: self.asset_dir,
            artifacts: self.artifacts,
            report_assets,
        }
    }
}

/// A callable wrapped with run tracking.
#[derive(Debug)]
pub struct Instrumented<C, B> {
    target: C,
    spec: RunSpec,
    backend: B,
    asset_dir: PathBuf,
    artifacts: Vec<ArtifactSpec>,
    report_assets: ReportAssets,
}

impl<C: Callable, B: TrackingBackend> Instrumented<C, B> {
    pub fn target(&self) -> &C {
        &self.target
    }

    pub fn spec(&self) -> &RunSpec {
        &self.spec
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn asset_dir(&self) -> &Path {
        &self.asset_dir
    }

    /// Invoke the target inside a tracked run.
    pub fn invoke(&self, args: &CallArgs) -> Result<C::Output, InstrumentError<C::Error>> {
        let name = self.spec.effective_name(self.target.identifier());
        let span = tracing::info_span!("run", project = %self.spec.project, name = %name);
        let _enter = span.enter();

        let request = RunRequest {
            project: self.spec.project.clone(),
            name,
            tags: self.spec.tags.clone(),
        };
        let handle = self.backend.open_run(&request).map_err(|err| {
            tracing::error!(error = %err, "failed to open run");
            InstrumentError::Backend(err)
        })?;
        let run = RunGuard::new(handle);
        tracing::info!(run_id = %run.handle().run_id(), tags = ?request.tags, "run opened");

        let signature = describe_or_empty(&self.target);
        if let Err(err) = run
            .handle()
            .attach_configuration(SIGNATURE_CONFIG, &signature.to_config())
        {
            tracing::warn!(error = %err, "failed to attach function signature");
            if let Err(text_err) = run
                .handle()
                .report_text(&format!("configuration attach failed: {err}"))
            {
                tracing::warn!(error = %text_err, "failed to report configuration warning");
            }
        }

        let failed_uploads = upload_all(run.handle(), &self.asset_dir, &self.artifacts);
        if failed_uploads > 0 {
            tracing::warn!(failed_uploads, "some supporting artifacts were not uploaded");
        }

        match self.target.call(args) {
            Ok(output) => {
                let summary = report(&args.positional, run.handle(), &self.report_assets);
                tracing::info!(
                    lead = summary.lead,
                    success = summary.success,
                    error = summary.error,
                    faults = summary.faults,
                    "run reported"
                );
                run.finish(RunStatus::Completed);
                Ok(output)
            }
            Err(err) => {
                tracing::warn!("target returned an error");
                run.finish(RunStatus::Failed);
                Err(InstrumentError::Target(err))
            }
        }
    }
}

impl<C: Callable, B: TrackingBackend> Callable for Instrumented<C, B> {
    type Output = C::Output;
    type Error = InstrumentError<C::Error>;

    fn identifier(&self) -> &str {
        self.target.identifier()
    }

    fn signature(&self) -> Result<Signature, IntrospectionError> {
        self.target.signature()
    }

    fn call(&self, args: &CallArgs) -> Result<Self::Output, Self::Error> {
        self.invoke(args)
    }
}

/// Owns an open handle and finalizes it exactly once.
///
/// Dropping an unfinished guard (a panicking target) finalizes as failed.
struct RunGuard<H: RunHandle> {
    handle: H,
    finished: bool,
}

impl<H: RunHandle> RunGuard<H> {
    fn new(handle: H) -> Self {
        Self {
            handle,
            finished: false,
        }
    }

    fn handle(&self) -> &H {
        &self.handle
    }

    fn finish(mut self, status: RunStatus) {
        self.finalize(status);
    }

    fn finalize(&mut self, status: RunStatus) {
        if self.finished {
            return;
        }
        self.finished = true;
        match self.handle.finalize(status) {
            Ok(()) => tracing::info!(run_id = %self.handle.run_id(), ?status, "run finalized"),
            Err(err) => {
                tracing::warn!(run_id = %self.handle.run_id(), error = %err, "run finalize failed")
            }
        }
    }
}

impl<H: RunHandle> Drop for RunGuard<H> {
    fn drop(&mut self) {
        self.finalize(RunStatus::Failed);
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::mock::{Operation, RecordingBackend};
    use crate::reporting::{ERROR_SERIES, SUCCESS_SERIES};
    use crate::signature::ParameterKind;
    use crate::value::ArgValue;

    fn assets() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("picasso.jpg"), [0xffu8, 0xd8, 0xff, 0xe0]).unwrap();
        fs::write(dir.path().join("dancing.jpg"), [0xffu8, 0xd8, 0xff, 0xe1]).unwrap();
        fs::write(dir.path().join("sample.json"), b"{}").unwrap();
        fs::write(dir.path().join("data.csv"), b"x\n1\n").unwrap();
        dir
    }

    fn spec() -> RunSpec {
        RunSpec::new("demo").with_tags(["alpha", "beta"])
    }

    fn summing_task(calls: Arc<AtomicUsize>) -> FnTask<impl Fn(&CallArgs) -> Result<i64, String>> {
        FnTask::new("sum_args", move |args: &CallArgs| -> Result<i64, String> {
            calls.fetch_add(1, Ordering::SeqCst);
            args.positional
                .iter()
                .map(|v| match v {
                    ArgValue::Int(i) => Ok(*i),
                    other => Err(format!("cannot sum {other}")),
                })
                .sum()
        })
        .with_params([
            ParameterDescriptor::new("args", ParameterKind::VarPositional),
            ParameterDescriptor::new("kwargs", ParameterKind::VarKeyword),
        ])
    }

    #[test]
    fn returns_target_result_and_reports() {
        let dir = assets();
        let calls = Arc::new(AtomicUsize::new(0));
        let backend = Arc::new(RecordingBackend::new());
        let wrapped = instrument(spec(), Arc::clone(&backend))
            .asset_dir(dir.path())
            .wrap(summing_task(Arc::clone(&calls)));

        let args = CallArgs::positional([1, 2, 3, 4]).kwarg("name", "Task");
        assert_eq!(wrapped.invoke(&args).unwrap(), 10);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let run = backend.last_run().unwrap();
        assert_eq!(run.request.name, "sum_args");
        assert_eq!(run.request.tags, vec!["alpha", "beta"]);
        assert_eq!(
            run.configuration(SIGNATURE_CONFIG).unwrap(),
            &serde_json::json!({
                "args": { "kind": "var_positional" },
                "kwargs": { "kind": "var_keyword" },
            })
        );
        assert_eq!(run.artifacts().len(), 3);
        assert_eq!(run.scalars(SUCCESS_SERIES), vec![(4.0, 2.0)]);
        assert_eq!(run.scalars(ERROR_SERIES), vec![(6.0, 3.0), (8.0, 4.0)]);
        assert_eq!(run.finalizations(), vec![RunStatus::Completed]);
    }

    #[test]
    fn explicit_name_wins() {
        let dir = assets();
        let backend = Arc::new(RecordingBackend::new());
        let wrapped = instrument(spec().with_name("nightly"), Arc::clone(&backend))
            .asset_dir(dir.path())
            .wrap(summing_task(Arc::new(AtomicUsize::new(0))));
        wrapped.invoke(&CallArgs::new()).unwrap();
        assert_eq!(backend.last_run().unwrap().request.name, "nightly");
    }

    #[test]
    fn empty_args_still_finalize_once() {
        let dir = assets();
        let calls = Arc::new(AtomicUsize::new(0));
        let backend = Arc::new(RecordingBackend::new());
        let wrapped = instrument(spec(), Arc::clone(&backend))
            .asset_dir(dir.path())
            .wrap(summing_task(Arc::clone(&calls)));

        assert_eq!(wrapped.invoke(&CallArgs::new()).unwrap(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let run = backend.last_run().unwrap();
        assert_eq!(run.reports(), 0);
        assert_eq!(run.finalizations().len(), 1);
    }

    #[test]
    fn unavailable_backend_skips_target() {
        let calls = Arc::new(AtomicUsize::new(0));
        let backend = Arc::new(RecordingBackend::new().unavailable());
        let wrapped =
            instrument(spec(), Arc::clone(&backend)).wrap(summing_task(Arc::clone(&calls)));

        let err = wrapped.invoke(&CallArgs::positional([1, 2])).unwrap_err();
        assert!(err.is_backend());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(backend.runs().is_empty());
    }

    #[test]
    fn target_error_propagates_after_finalize() {
        let dir = assets();
        let backend = Arc::new(RecordingBackend::new());
        let wrapped = instrument(spec(), Arc::clone(&backend))
            .asset_dir(dir.path())
            .wrap(summing_task(Arc::new(AtomicUsize::new(0))));

        let err = wrapped
            .invoke(&CallArgs::positional([ArgValue::Int(1), ArgValue::from("x")]))
            .unwrap_err();
        assert_eq!(err.into_target().unwrap(), "cannot sum \"x\"");

        let run = backend.last_run().unwrap();
        assert_eq!(run.finalizations(), vec![RunStatus::Failed]);
        assert_eq!(run.reports(), 0);
    }

    #[test]
    fn panicking_target_is_finalized() {
        let dir = assets();
        let backend = Arc::new(RecordingBackend::new());
        let wrapped = instrument(spec(), Arc::clone(&backend))
            .asset_dir(dir.path())
            .wrap(FnTask::new("boom", |_: &CallArgs| -> Result<(), String> {
                panic!("target exploded")
            }));

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            wrapped.invoke(&CallArgs::positional([1]))
        }));
        assert!(outcome.is_err());
        assert_eq!(
            backend.last_run().unwrap().finalizations(),
            vec![RunStatus::Failed]
        );
    }

    #[test]
    fn missing_artifact_warns_and_proceeds() {
        let dir = assets();
        fs::remove_file(dir.path().join("sample.json")).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let backend = Arc::new(RecordingBackend::new());
        let wrapped = instrument(spec(), Arc::clone(&backend))
            .asset_dir(dir.path())
            .wrap(summing_task(Arc::clone(&calls)));

        assert_eq!(wrapped.invoke(&CallArgs::positional([1, 2])).unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let run = backend.last_run().unwrap();
        assert!(run.texts()[0].starts_with("artifact upload failed: args_json_file"));
        assert_eq!(run.images(), 1);
        assert_eq!(run.scalars(ERROR_SERIES), vec![(4.0, 2.0)]);
    }

    #[test]
    fn explicit_report_assets_survive_asset_dir() {
        let lead = assets();
        let artifacts_only = assets();
        fs::remove_file(artifacts_only.path().join("picasso.jpg")).unwrap();

        let custom = ReportAssets::new(lead.path());
        for wrapped in [
            instrument(spec(), RecordingBackend::new())
                .report_assets(custom.clone())
                .asset_dir(artifacts_only.path())
                .wrap(summing_task(Arc::new(AtomicUsize::new(0)))),
            instrument(spec(), RecordingBackend::new())
                .asset_dir(artifacts_only.path())
                .report_assets(custom.clone())
                .wrap(summing_task(Arc::new(AtomicUsize::new(0)))),
        ] {
            wrapped.invoke(&CallArgs::positional([1])).unwrap();
            let run = wrapped.backend().last_run().unwrap();
            assert_eq!(run.images(), 1);
            assert!(run.texts().is_empty());
        }
    }

    #[test]
    fn undeclared_signature_degrades_to_empty() {
        let dir = assets();
        let backend = Arc::new(RecordingBackend::new());
        let wrapped = instrument(spec(), Arc::clone(&backend))
            .asset_dir(dir.path())
            .wrap(FnTask::new("opaque", |_: &CallArgs| Ok::<_, String>(())));

        wrapped.invoke(&CallArgs::positional([1])).unwrap();
        let run = backend.last_run().unwrap();
        assert_eq!(
            run.configuration(SIGNATURE_CONFIG).unwrap(),
            &serde_json::json!({})
        );
        assert_eq!(run.finalizations(), vec![RunStatus::Completed]);
    }

    #[test]
    fn finalize_failure_is_not_fatal() {
        let dir = assets();
        let backend = Arc::new(RecordingBackend::new().failing(Operation::Finalize));
        let wrapped = instrument(spec(), Arc::clone(&backend))
            .asset_dir(dir.path())
            .wrap(summing_task(Arc::new(AtomicUsize::new(0))));
        assert_eq!(wrapped.invoke(&CallArgs::positional([2, 3])).unwrap(), 5);
    }

    #[test]
    fn wrapping_composes() {
        let dir = assets();
        let inner_backend = Arc::new(RecordingBackend::new());
        let outer_backend = Arc::new(RecordingBackend::new());
        let inner = instrument(RunSpec::new("inner"), Arc::clone(&inner_backend))
            .asset_dir(dir.path())
            .wrap(summing_task(Arc::new(AtomicUsize::new(0))));
        let outer = instrument(RunSpec::new("outer"), Arc::clone(&outer_backend))
            .asset_dir(dir.path())
            .wrap(inner);

        assert_eq!(outer.identifier(), "sum_args");
        assert_eq!(outer.call(&CallArgs::positional([5])).unwrap(), 5);
        assert_eq!(inner_backend.runs().len(), 1);
        assert_eq!(outer_backend.runs().len(), 1);
    }

    #[test]
    fn concurrent_invocations_get_separate_runs() {
        let dir = assets();
        let backend = Arc::new(RecordingBackend::new());
        let wrapped = Arc::new(
            instrument(spec(), Arc::clone(&backend))
                .asset_dir(dir.path())
                .wrap(summing_task(Arc::new(AtomicUsize::new(0)))),
        );

        let handles: Vec<_> = (0..4i64)
            .map(|i| {
                let wrapped = Arc::clone(&wrapped);
                std::thread::spawn(move || wrapped.invoke(&CallArgs::positional([i, i, i])))
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap().is_ok());
        }

        let runs = backend.runs();
        assert_eq!(runs.len(), 4);
        for run in runs {
            assert_eq!(run.finalizations().len(), 1);
            assert_eq!(run.scalars(SUCCESS_SERIES).len(), 1);
            assert_eq!(run.scalars(ERROR_SERIES).len(), 1);
        }
    }
}
