//! Per-argument reporting pass.
//!
//! Walks the positional arguments of one call once, in order. Index 0 takes
//! the lead branch (image + chart). Indices from `ceil(n / 2)` on take the
//! simulated-failure branch; the rest report success. A failure while
//! reporting any index is converted into the same error-series scalar and
//! console line the failure branch emits, and the pass moves on.

use std::fs;
use std::path::{Path, PathBuf};

use crate::backend::{BackendError, ChartSpec, ImagePayload, RunHandle};
use crate::value::ArgValue;

pub const SCALAR_TITLE: &str = "Result";
pub const SUCCESS_SERIES: &str = "Success";
pub const ERROR_SERIES: &str = "Error";
pub const IMAGE_TITLE: &str = "Image";
pub const IMAGE_SERIES: &str = "Picasso";
pub const CHART_TITLE: &str = "Pie Dio";
pub const CHART_SERIES: &str = "Success";

/// Default lead image file name inside the asset directory.
pub const LEAD_IMAGE_FILE: &str = "picasso.jpg";

/// Errors raised while reporting a single index.
#[derive(Debug, thiserror::Error)]
pub enum ReportEmissionError {
    #[error("value at iteration № {iteration} is not numeric ({kind})")]
    NonNumeric { iteration: usize, kind: &'static str },
    #[error("lead image {} unavailable: {reason}", .path.display())]
    LeadImage { path: PathBuf, reason: String },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Which reporting path an index takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    Lead,
    Success,
    Error,
}

impl Branch {
    /// First index of the failure branch: `ceil(len / 2)`.
    pub fn threshold(len: usize) -> usize {
        len.div_ceil(2)
    }

    pub fn for_index(index: usize, threshold: usize) -> Self {
        if index == 0 {
            Branch::Lead
        } else if index >= threshold {
            Branch::Error
        } else {
            Branch::Success
        }
    }

    /// Branch of every index of an argument list of length `len`.
    pub fn plan(len: usize) -> Vec<Branch> {
        let threshold = Self::threshold(len);
        (0..len).map(|i| Self::for_index(i, threshold)).collect()
    }
}

/// Counts of what one pass emitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportSummary {
    pub lead: usize,
    pub success: usize,
    pub error: usize,
    /// Indices whose reporting failed and was converted to the error pattern.
    pub faults: usize,
}

/// Fixed payloads used by the lead branch.
#[derive(Debug, Clone)]
pub struct ReportAssets {
    lead_image: PathBuf,
    chart: ChartSpec,
}

impl ReportAssets {
    /// Assets resolved against `asset_dir`.
    pub fn new(asset_dir: impl AsRef<Path>) -> Self {
        Self {
            lead_image: asset_dir.as_ref().join(LEAD_IMAGE_FILE),
            chart: composition_chart(),
        }
    }

    pub fn with_lead_image(mut self, path: impl Into<PathBuf>) -> Self {
        self.lead_image = path.into();
        self
    }

    pub fn with_chart(mut self, chart: ChartSpec) -> Self {
        self.chart = chart;
        self
    }

    pub fn lead_image_path(&self) -> &Path {
        &self.lead_image
    }

    pub fn chart(&self) -> &ChartSpec {
        &self.chart
    }

    fn load_lead_image(&self) -> Result<ImagePayload, ReportEmissionError> {
        let bytes = fs::read(&self.lead_image).map_err(|e| ReportEmissionError::LeadImage {
            path: self.lead_image.clone(),
            reason: e.to_string(),
        })?;
        ImagePayload::from_bytes(bytes).ok_or_else(|| ReportEmissionError::LeadImage {
            path: self.lead_image.clone(),
            reason: "not a jpeg or png image".to_string(),
        })
    }
}

impl Default for ReportAssets {
    fn default() -> Self {
        Self::new("./")
    }
}

/// The fixed categorical chart (gas composition pie).
pub fn composition_chart() -> ChartSpec {
    ChartSpec::pie(
        ["Oxygen", "Hydrogen", "Carbon_Dioxide", "Nitrogen"],
        [4500.0, 2500.0, 1053.0, 500.0],
    )
}

/// Diagnostic line for a failure at 1-based `iteration`.
pub fn diagnostic(iteration: usize) -> String {
    format!("error occurred at iteration № {iteration}")
}

/// Run the reporting pass over `args`.
///
/// Never fails: per-index failures end up as error-series reports.
pub fn report<H>(args: &[ArgValue], handle: &H, assets: &ReportAssets) -> ReportSummary
where
    H: RunHandle + ?Sized,
{
    let threshold = Branch::threshold(args.len());
    let mut summary = ReportSummary::default();

    for (index, value) in args.iter().enumerate() {
        let outcome = match Branch::for_index(index, threshold) {
            Branch::Lead => emit_lead(handle, assets, index, value).map(|()| summary.lead += 1),
            Branch::Success => emit_success(handle, index, value).map(|()| summary.success += 1),
            Branch::Error => {
                emit_failure(handle, index, value, &diagnostic(index + 1));
                summary.error += 1;
                Ok(())
            }
        };

        if let Err(err) = outcome {
            tracing::warn!(index, error = %err, "report emission failed");
            emit_failure(handle, index, value, &err.to_string());
            summary.faults += 1;
        }
    }

    tracing::debug!(
        args = args.len(),
        threshold,
        lead = summary.lead,
        success = summary.success,
        error = summary.error,
        faults = summary.faults,
        "reporting pass complete"
    );
    summary
}

fn numeric(index: usize, value: &ArgValue) -> Result<f64, ReportEmissionError> {
    value.as_f64().ok_or(ReportEmissionError::NonNumeric {
        iteration: index + 1,
        kind: value.kind(),
    })
}

fn emit_lead<H: RunHandle + ?Sized>(
    handle: &H,
    assets: &ReportAssets,
    index: usize,
    value: &ArgValue,
) -> Result<(), ReportEmissionError> {
    let x = numeric(index, value)?;
    let image = assets.load_lead_image()?;
    handle.report_image(IMAGE_TITLE, IMAGE_SERIES, x, &image)?;
    handle.report_chart(CHART_TITLE, CHART_SERIES, x, &assets.chart)?;
    Ok(())
}

fn emit_success<H: RunHandle + ?Sized>(
    handle: &H,
    index: usize,
    value: &ArgValue,
) -> Result<(), ReportEmissionError> {
    let x = numeric(index, value)?;
    handle.report_scalar(SCALAR_TITLE, SUCCESS_SERIES, x * 2.0, x)?;
    Ok(())
}

// Shared by the failure branch and by converted faults.
fn emit_failure<H: RunHandle + ?Sized>(handle: &H, index: usize, value: &ArgValue, message: &str) {
    let (reported, x) = match value.as_f64() {
        Some(v) => (v * 2.0, v),
        None => (0.0, (index + 1) as f64),
    };
    if let Err(err) = handle.report_scalar(SCALAR_TITLE, ERROR_SERIES, reported, x) {
        tracing::warn!(index, error = %err, "failed to report error scalar");
    }
    if let Err(err) = handle.report_text(message) {
        tracing::warn!(index, error = %err, "failed to report diagnostic text");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{RunRequest, TrackingBackend};
    use crate::mock::{Operation, Recorded, RecordedRun, RecordingBackend};

    const JPEG: &[u8] = &[0xff, 0xd8, 0xff, 0xe0, 0x00, 0x10, b'J', b'F', b'I', b'F'];

    fn assets_with_image() -> (tempfile::TempDir, ReportAssets) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(LEAD_IMAGE_FILE), JPEG).unwrap();
        let assets = ReportAssets::new(dir.path());
        (dir, assets)
    }

    fn run_pass(
        backend: RecordingBackend,
        args: &[ArgValue],
        assets: &ReportAssets,
    ) -> (ReportSummary, RecordedRun) {
        let handle = backend
            .open_run(&RunRequest {
                project: "p".to_string(),
                name: "n".to_string(),
                tags: vec![],
            })
            .unwrap();
        let summary = report(args, &handle, assets);
        (summary, backend.last_run().unwrap())
    }

    fn ints(values: &[i64]) -> Vec<ArgValue> {
        values.iter().copied().map(ArgValue::Int).collect()
    }

    #[test]
    fn threshold_is_ceil_half() {
        assert_eq!(Branch::threshold(0), 0);
        assert_eq!(Branch::threshold(1), 1);
        assert_eq!(Branch::threshold(4), 2);
        assert_eq!(Branch::threshold(5), 3);
    }

    #[test]
    fn plan_splits_at_threshold() {
        use Branch::*;
        assert!(Branch::plan(0).is_empty());
        assert_eq!(Branch::plan(1), vec![Lead]);
        assert_eq!(Branch::plan(2), vec![Lead, Error]);
        assert_eq!(Branch::plan(5), vec![Lead, Success, Success, Error, Error]);
    }

    #[test]
    fn branch_counts_match_formula() {
        for n in 2..40usize {
            let plan = Branch::plan(n);
            let half = n.div_ceil(2);
            let errors = plan.iter().filter(|b| **b == Branch::Error).count();
            let successes = plan.iter().filter(|b| **b == Branch::Success).count();
            assert_eq!(errors, n - half, "n = {n}");
            assert_eq!(successes, half - 1, "n = {n}");
            assert_eq!(plan.iter().filter(|b| **b == Branch::Lead).count(), 1);
        }
    }

    #[test]
    fn four_argument_scenario() {
        let (_dir, assets) = assets_with_image();
        let (summary, run) = run_pass(RecordingBackend::new(), &ints(&[1, 2, 3, 4]), &assets);

        assert_eq!(
            summary,
            ReportSummary {
                lead: 1,
                success: 1,
                error: 2,
                faults: 0
            }
        );
        assert_eq!(run.images(), 1);
        assert_eq!(run.charts(), 1);
        assert!(matches!(
            &run.events[0],
            Recorded::Image { title, series, x, .. }
                if title == IMAGE_TITLE && series == IMAGE_SERIES && *x == 1.0
        ));
        assert!(matches!(
            &run.events[1],
            Recorded::Chart { title, x, .. } if title == CHART_TITLE && *x == 1.0
        ));
        assert_eq!(run.scalars(SUCCESS_SERIES), vec![(4.0, 2.0)]);
        assert_eq!(run.scalars(ERROR_SERIES), vec![(6.0, 3.0), (8.0, 4.0)]);
        assert_eq!(
            run.texts(),
            vec!["error occurred at iteration № 3", "error occurred at iteration № 4"]
        );
    }

    #[test]
    fn float_values_keep_their_fraction() {
        let (_dir, assets) = assets_with_image();
        let args: Vec<ArgValue> = [0.5, 1.25, 2.5, 3.75]
            .into_iter()
            .map(ArgValue::Float)
            .collect();
        let (summary, run) = run_pass(RecordingBackend::new(), &args, &assets);

        assert_eq!(summary.faults, 0);
        assert!(matches!(&run.events[0], Recorded::Image { x, .. } if *x == 0.5));
        assert!(matches!(&run.events[1], Recorded::Chart { x, .. } if *x == 0.5));
        assert_eq!(run.scalars(SUCCESS_SERIES), vec![(2.5, 1.25)]);
        assert_eq!(run.scalars(ERROR_SERIES), vec![(5.0, 2.5), (7.5, 3.75)]);
        assert_eq!(
            run.texts(),
            vec!["error occurred at iteration № 3", "error occurred at iteration № 4"]
        );
    }

    #[test]
    fn empty_args_emit_nothing() {
        let (_dir, assets) = assets_with_image();
        let (summary, run) = run_pass(RecordingBackend::new(), &[], &assets);
        assert_eq!(summary, ReportSummary::default());
        assert_eq!(run.reports(), 0);
    }

    #[test]
    fn single_arg_takes_lead_only() {
        let (_dir, assets) = assets_with_image();
        let (summary, run) = run_pass(RecordingBackend::new(), &ints(&[7]), &assets);
        assert_eq!(summary.lead, 1);
        assert_eq!(run.reports(), 2);
        assert!(run.scalars(SUCCESS_SERIES).is_empty());
        assert!(run.scalars(ERROR_SERIES).is_empty());
    }

    #[test]
    fn missing_lead_image_becomes_error_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let assets = ReportAssets::new(dir.path());
        let (summary, run) = run_pass(RecordingBackend::new(), &ints(&[5, 6]), &assets);

        assert_eq!(summary.faults, 1);
        assert_eq!(summary.error, 1);
        assert_eq!(run.images(), 0);
        assert_eq!(run.scalars(ERROR_SERIES), vec![(10.0, 5.0), (12.0, 6.0)]);
        let texts = run.texts();
        assert!(texts[0].contains("lead image"));
        assert_eq!(texts[1], "error occurred at iteration № 2");
    }

    #[test]
    fn malformed_value_is_contained() {
        let (_dir, assets) = assets_with_image();
        let args = vec![
            ArgValue::Int(1),
            ArgValue::Str("oops".to_string()),
            ArgValue::Int(3),
            ArgValue::Int(4),
            ArgValue::Int(5),
        ];
        let (summary, run) = run_pass(RecordingBackend::new(), &args, &assets);

        assert_eq!(summary.faults, 1);
        assert_eq!(summary.success, 1);
        assert_eq!(summary.error, 2);
        assert_eq!(run.scalars(SUCCESS_SERIES), vec![(6.0, 3.0)]);
        // The malformed index reports at its 1-based position.
        assert_eq!(
            run.scalars(ERROR_SERIES),
            vec![(0.0, 2.0), (8.0, 4.0), (10.0, 5.0)]
        );
        assert!(run.texts()[0].contains("not numeric"));
    }

    #[test]
    fn backend_failures_do_not_abort_the_pass() {
        let (_dir, assets) = assets_with_image();
        let backend = RecordingBackend::new().failing(Operation::Scalar);
        let (summary, run) = run_pass(backend, &ints(&[1, 2, 3, 4, 5, 6]), &assets);

        // Success indices 1 and 2 fault; their error scalars fail too, texts survive.
        assert_eq!(summary.lead, 1);
        assert_eq!(summary.faults, 2);
        assert_eq!(summary.error, 3);
        assert_eq!(run.texts().len(), 5);
        assert!(run.scalars(ERROR_SERIES).is_empty());
    }
}
