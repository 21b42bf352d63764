//! Local run bundle backend (std-only).
//!
//! Each run lives in `<base>/runs/<run_id>/`:
//!
//! ```text
//! run.json                 project, name, tags, status, timestamps
//! configuration/<name>.json
//! artifacts/<name>.<ext>
//! scalars.ndjson           one ScalarRecord per line
//! console.ndjson           one TextRecord per line
//! plots.ndjson             one ChartRecord per line
//! debug_samples.ndjson     one ImageRecord per line
//! debug_samples/<sha>.<ext>
//! manifest.json            path-addressed SHA-256 manifest, written at finalize
//! ```

use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use sha2::{Digest, Sha256};

use runtrace_core::backend::{
    ArtifactBlob, BackendError, ChartSpec, ImagePayload, RunHandle, RunRequest, RunStatus,
    TrackingBackend,
};
use runtrace_core::observe::{
    hex_lower, unix_nanos_now, ChartRecord, ImageRecord, RunId, ScalarRecord, TextRecord,
    RECORD_SCHEMA_V1,
};

const SCHEMA_VERSION_V1: u32 = 1;
const MANIFEST_FILE: &str = "manifest.json";
const HASH_ALGO: &str = "sha256";

/// Contents of `manifest.json`.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct Manifest {
    schema_version: u32,
    run_id: RunId,
    hash_algo: String,
    entries: Vec<ManifestEntry>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct ManifestEntry {
    // Relative to the run directory.
    path: String,
    #[serde(flatten)]
    digest: FileDigest,
    required: bool,
}

/// Contents of `run.json`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RunFileV1 {
    pub schema_version: u32,
    pub run_id: RunId,
    pub project: String,
    pub name: String,
    pub tags: Vec<String>,
    pub status: RunStatus,
    pub created_unix_nanos: u64,
    pub finalized_unix_nanos: Option<u64>,
    pub runtrace_version: String,
}

/// Backend that writes run bundles under a base directory.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    base: PathBuf,
}

impl LocalBackend {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Directory holding every run bundle.
    pub fn runs_dir(&self) -> PathBuf {
        self.base.join("runs")
    }

    /// Bundles currently present, sorted by run directory name.
    pub fn list_runs(&self) -> io::Result<Vec<RunBundle>> {
        let dir = self.runs_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                paths.push(entry.path());
            }
        }
        paths.sort();
        paths.into_iter().map(RunBundle::open).collect()
    }
}

impl TrackingBackend for LocalBackend {
    type Handle = LocalRun;

    fn open_run(&self, request: &RunRequest) -> Result<Self::Handle, BackendError> {
        let runs_dir = self.runs_dir();
        fs::create_dir_all(&runs_dir).map_err(|e| {
            BackendError::Unavailable(format!("cannot create {}: {e}", runs_dir.display()))
        })?;

        let created = unix_nanos_now();
        let run_id = RunId::derive(&request.project, &request.name, created);
        let bundle = RunBundle::create(&self.base, run_id, request, created)?;
        tracing::debug!(run_dir = %bundle.run_dir().display(), "run bundle created");
        Ok(LocalRun::new(bundle))
    }
}

/// A reader/writer for a single run bundle (`runs/<run_id>/...`).
#[derive(Debug, Clone)]
pub struct RunBundle {
    run_dir: PathBuf,
    run_id: RunId,
}

impl RunBundle {
    /// Open an existing bundle directory by reading `run.json`.
    pub fn open(run_dir: impl AsRef<Path>) -> io::Result<Self> {
        let run_dir = run_dir.as_ref().to_path_buf();
        let run_file: RunFileV1 = read_json(&run_dir.join("run.json"))?;
        Ok(Self {
            run_dir,
            run_id: run_file.run_id,
        })
    }

    /// Create `<base>/runs/<run_id>/` with the baseline files.
    pub fn create(
        base: impl AsRef<Path>,
        run_id: RunId,
        request: &RunRequest,
        created_unix_nanos: u64,
    ) -> io::Result<Self> {
        if !run_id.is_valid() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "run_id must be non-zero",
            ));
        }

        let run_dir = base.as_ref().join("runs").join(run_id.to_string());
        if run_dir.exists() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "run bundle already exists",
            ));
        }

        fs::create_dir_all(run_dir.join("configuration"))?;
        fs::create_dir_all(run_dir.join("artifacts"))?;
        fs::create_dir_all(run_dir.join("debug_samples"))?;

        let run_file = RunFileV1 {
            schema_version: SCHEMA_VERSION_V1,
            run_id,
            project: request.project.clone(),
            name: request.name.clone(),
            tags: request.tags.clone(),
            status: RunStatus::Running,
            created_unix_nanos,
            finalized_unix_nanos: None,
            runtrace_version: env!("CARGO_PKG_VERSION").to_string(),
        };
        write_json(&run_dir.join("run.json"), &run_file)?;

        // Empty record logs are valid.
        for rel in NDJSON_PATHS {
            File::create(run_dir.join(rel))?;
        }

        Ok(Self { run_dir, run_id })
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn read_run_file(&self) -> io::Result<RunFileV1> {
        read_json(&self.run_dir.join("run.json"))
    }

    pub fn write_configuration(&self, name: &str, config: &serde_json::Value) -> io::Result<()> {
        let file = format!("{}.json", checked_name(name)?);
        write_json(&self.run_dir.join("configuration").join(file), config)
    }

    pub fn read_configuration(&self, name: &str) -> io::Result<serde_json::Value> {
        let file = format!("{}.json", checked_name(name)?);
        read_json(&self.run_dir.join("configuration").join(file))
    }

    /// Store an artifact as `artifacts/<name>[.<ext>]`; returns the relative path.
    pub fn write_artifact(&self, artifact: &ArtifactBlob) -> io::Result<String> {
        let name = checked_name(&artifact.name)?;
        let file = match Path::new(&artifact.file_name)
            .extension()
            .and_then(|e| e.to_str())
        {
            Some(ext) => format!("{name}.{ext}"),
            None => name.to_string(),
        };
        write_atomically(&self.run_dir.join("artifacts").join(&file), &artifact.bytes)?;
        Ok(format!("artifacts/{file}"))
    }

    pub fn append_scalar(&self, record: &ScalarRecord) -> io::Result<()> {
        append_record(&self.run_dir.join("scalars.ndjson"), record)
    }

    pub fn append_text(&self, record: &TextRecord) -> io::Result<()> {
        append_record(&self.run_dir.join("console.ndjson"), record)
    }

    pub fn append_chart(&self, record: &ChartRecord) -> io::Result<()> {
        append_record(&self.run_dir.join("plots.ndjson"), record)
    }

    /// Store the image payload content-addressed and append its record.
    pub fn append_image(
        &self,
        title: &str,
        series: &str,
        x: f64,
        image: &ImagePayload,
    ) -> io::Result<ImageRecord> {
        let digest = hex_lower(&Sha256::digest(&image.bytes));
        let file_name = format!("debug_samples/{digest}.{}", image.format.extension());
        let path = self.run_dir.join(&file_name);
        if !path.exists() {
            write_atomically(&path, &image.bytes)?;
        }
        let record = ImageRecord {
            schema_version: RECORD_SCHEMA_V1,
            ts_unix_nanos: unix_nanos_now(),
            title: title.to_string(),
            series: series.to_string(),
            x,
            file_name,
            sha256: digest,
            bytes: image.bytes.len() as u64,
        };
        append_record(&self.run_dir.join("debug_samples.ndjson"), &record)?;
        Ok(record)
    }

    pub fn read_scalars(&self) -> io::Result<Vec<ScalarRecord>> {
        read_records(&self.run_dir.join("scalars.ndjson"))
    }

    pub fn read_console(&self) -> io::Result<Vec<TextRecord>> {
        read_records(&self.run_dir.join("console.ndjson"))
    }

    pub fn read_charts(&self) -> io::Result<Vec<ChartRecord>> {
        read_records(&self.run_dir.join("plots.ndjson"))
    }

    pub fn read_images(&self) -> io::Result<Vec<ImageRecord>> {
        read_records(&self.run_dir.join("debug_samples.ndjson"))
    }

    /// Record the terminal status in `run.json`.
    pub fn mark_finished(&self, status: RunStatus) -> io::Result<()> {
        let mut run_file = self.read_run_file()?;
        run_file.status = status;
        run_file.finalized_unix_nanos = Some(unix_nanos_now());
        write_json(&self.run_dir.join("run.json"), &run_file)
    }

    /// Write `manifest.json` covering every file currently in the bundle.
    pub fn finalize_manifest(&self) -> io::Result<()> {
        let manifest = Manifest::scan(self)?;
        write_json(&self.run_dir.join(MANIFEST_FILE), &manifest)
    }

    /// Check `manifest.json` against the bytes now on disk.
    pub fn validate_manifest(&self) -> io::Result<()> {
        let manifest: Manifest = read_json(&self.run_dir.join(MANIFEST_FILE))?;
        manifest.verify(self)
    }

    /// `/`-separated paths of every file in the bundle, sorted.
    pub fn files(&self) -> io::Result<Vec<String>> {
        let mut out = Vec::new();
        let mut pending = vec![PathBuf::new()];
        while let Some(rel_dir) = pending.pop() {
            for entry in fs::read_dir(self.run_dir.join(&rel_dir))? {
                let entry = entry?;
                let rel = rel_dir.join(entry.file_name());
                let ty = entry.file_type()?;
                if ty.is_dir() {
                    pending.push(rel);
                } else if ty.is_file() && !is_scratch(&entry.file_name()) {
                    out.push(slash_path(&rel));
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

/// Size and SHA-256 of one bundle file.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
struct FileDigest {
    sha256: String,
    bytes: u64,
}

impl FileDigest {
    fn of(path: &Path) -> io::Result<Self> {
        let mut hasher = Sha256::new();
        let bytes = io::copy(&mut File::open(path)?, &mut hasher)?;
        Ok(Self {
            sha256: hex_lower(&hasher.finalize()),
            bytes,
        })
    }
}

impl Manifest {
    // `manifest.json` never lists itself.
    fn scan(bundle: &RunBundle) -> io::Result<Self> {
        if let Some(missing) = REQUIRED_PATHS
            .iter()
            .find(|rel| !bundle.run_dir.join(rel).is_file())
        {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("missing required bundle file: {missing}"),
            ));
        }

        let entries = bundle
            .files()?
            .into_iter()
            .filter(|rel| rel != MANIFEST_FILE)
            .map(|rel| {
                let digest = FileDigest::of(&bundle.run_dir.join(&rel))?;
                Ok(ManifestEntry {
                    required: REQUIRED_PATHS.contains(&rel.as_str()),
                    path: rel,
                    digest,
                })
            })
            .collect::<io::Result<Vec<_>>>()?;

        Ok(Self {
            schema_version: SCHEMA_VERSION_V1,
            run_id: bundle.run_id,
            hash_algo: HASH_ALGO.to_string(),
            entries,
        })
    }

    fn verify(&self, bundle: &RunBundle) -> io::Result<()> {
        if self.schema_version != SCHEMA_VERSION_V1 {
            return Err(bad_data("unsupported manifest schema_version"));
        }
        if self.run_id != bundle.run_id {
            return Err(bad_data("manifest run_id mismatch"));
        }
        if self.hash_algo != HASH_ALGO {
            return Err(bad_data(format!("unsupported hash algorithm {}", self.hash_algo)));
        }
        if let Some(unlisted) = REQUIRED_PATHS
            .iter()
            .find(|req| !self.entries.iter().any(|e| e.path == **req))
        {
            return Err(bad_data(format!("manifest does not list {unlisted}")));
        }

        for entry in &self.entries {
            let actual = FileDigest::of(&bundle.run_dir.join(&entry.path)).map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("missing file listed in manifest: {}", entry.path),
                    )
                } else {
                    e
                }
            })?;
            if actual.bytes != entry.digest.bytes {
                return Err(bad_data(format!(
                    "size mismatch for {} (expected {}, found {})",
                    entry.path, entry.digest.bytes, actual.bytes
                )));
            }
            if actual.sha256 != entry.digest.sha256 {
                return Err(bad_data(format!("sha256 mismatch for {}", entry.path)));
            }
        }
        Ok(())
    }
}

/// Run handle backed by a [`RunBundle`].
///
/// Writes are serialized by an in-process mutex so NDJSON lines never
/// interleave.
#[derive(Debug)]
pub struct LocalRun {
    bundle: RunBundle,
    // `true` once finalized.
    closed: Mutex<bool>,
}

impl LocalRun {
    pub fn new(bundle: RunBundle) -> Self {
        Self {
            bundle,
            closed: Mutex::new(false),
        }
    }

    pub fn bundle(&self) -> &RunBundle {
        &self.bundle
    }

    fn guard(&self) -> Result<MutexGuard<'_, bool>, BackendError> {
        let guard = self.closed.lock().map_err(|_| {
            BackendError::Io(io::Error::new(
                io::ErrorKind::Other,
                "run handle mutex poisoned",
            ))
        })?;
        if *guard {
            return Err(BackendError::Closed(self.bundle.run_id));
        }
        Ok(guard)
    }
}

impl RunHandle for LocalRun {
    fn run_id(&self) -> RunId {
        self.bundle.run_id
    }

    fn attach_configuration(
        &self,
        name: &str,
        config: &serde_json::Value,
    ) -> Result<(), BackendError> {
        let _g = self.guard()?;
        Ok(self.bundle.write_configuration(name, config)?)
    }

    fn upload_artifact(&self, artifact: &ArtifactBlob) -> Result<(), BackendError> {
        let _g = self.guard()?;
        let rel = self.bundle.write_artifact(artifact)?;
        tracing::debug!(artifact = %artifact.name, path = %rel, "artifact stored");
        Ok(())
    }

    fn report_scalar(
        &self,
        title: &str,
        series: &str,
        value: f64,
        x: f64,
    ) -> Result<(), BackendError> {
        if !value.is_finite() || !x.is_finite() {
            return Err(BackendError::Rejected {
                operation: "report_scalar",
                reason: format!("non-finite point ({value}, {x})"),
            });
        }
        let _g = self.guard()?;
        Ok(self.bundle.append_scalar(&ScalarRecord {
            schema_version: RECORD_SCHEMA_V1,
            ts_unix_nanos: unix_nanos_now(),
            title: title.to_string(),
            series: series.to_string(),
            value,
            x,
        })?)
    }

    fn report_text(&self, text: &str) -> Result<(), BackendError> {
        let _g = self.guard()?;
        Ok(self.bundle.append_text(&TextRecord {
            schema_version: RECORD_SCHEMA_V1,
            ts_unix_nanos: unix_nanos_now(),
            text: text.to_string(),
        })?)
    }

    fn report_image(
        &self,
        title: &str,
        series: &str,
        x: f64,
        image: &ImagePayload,
    ) -> Result<(), BackendError> {
        let _g = self.guard()?;
        self.bundle.append_image(title, series, x, image)?;
        Ok(())
    }

    fn report_chart(
        &self,
        title: &str,
        series: &str,
        x: f64,
        chart: &ChartSpec,
    ) -> Result<(), BackendError> {
        let _g = self.guard()?;
        Ok(self.bundle.append_chart(&ChartRecord {
            schema_version: RECORD_SCHEMA_V1,
            ts_unix_nanos: unix_nanos_now(),
            title: title.to_string(),
            series: series.to_string(),
            x,
            figure: chart.figure.clone(),
        })?)
    }

    fn finalize(&self, status: RunStatus) -> Result<(), BackendError> {
        let mut closed = self.guard()?;
        *closed = true;
        self.bundle.mark_finished(status)?;
        self.bundle.finalize_manifest()?;
        Ok(())
    }
}

const NDJSON_PATHS: &[&str] = &[
    "scalars.ndjson",
    "console.ndjson",
    "plots.ndjson",
    "debug_samples.ndjson",
];

const REQUIRED_PATHS: &[&str] = &[
    "run.json",
    "scalars.ndjson",
    "console.ndjson",
    "plots.ndjson",
    "debug_samples.ndjson",
];

// Names become file names; keep them to one path segment.
fn checked_name(name: &str) -> io::Result<&str> {
    let ok = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if ok {
        Ok(name)
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid name for a bundle file: {name:?}"),
        ))
    }
}

fn is_scratch(name: &OsStr) -> bool {
    name.to_str().is_some_and(|n| n.starts_with(".tmp"))
}

fn slash_path(rel: &Path) -> String {
    rel.iter()
        .map(|c| c.to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn bad_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn write_json<T: serde::Serialize + ?Sized>(path: &Path, value: &T) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    write_atomically(path, &json)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<T> {
    let file = File::open(path)?;
    Ok(serde_json::from_reader(io::BufReader::new(file))?)
}

// One `write_all` per record so concurrent readers never see half a line.
fn append_record<T: serde::Serialize>(path: &Path, record: &T) -> io::Result<()> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?
        .write_all(&line)
}

fn read_records<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Vec<T>> {
    let reader = io::BufReader::new(File::open(path)?);
    serde_json::Deserializer::from_reader(reader)
        .into_iter::<T>()
        .map(|record| record.map_err(io::Error::from))
        .collect()
}

// Stage in the target directory, then rename over the destination.
fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "bundle path has no parent"))?;
    fs::create_dir_all(dir)?;
    let mut staged = tempfile::NamedTempFile::new_in(dir)?;
    staged.write_all(bytes)?;
    staged.as_file().sync_all()?;
    staged.persist(path).map_err(io::Error::from)?;
    Ok(())
}
