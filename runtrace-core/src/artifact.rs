//! Supporting artifacts uploaded before the target runs.
//!
//! The set is fixed per instrumentor and resolved against an asset directory.
//! Every failure is reported on the run's console and otherwise ignored.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::backend::{ArtifactBlob, ArtifactKind, BackendError, ImageFormat, RunHandle};

/// Errors raised while uploading one artifact.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactUploadError {
    #[error("artifact upload failed: {name}: cannot read {}: {source}", .path.display())]
    Read {
        name: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("artifact upload failed: {name}: {} is not a jpeg or png image", .path.display())]
    NotAnImage { name: String, path: PathBuf },
    #[error("artifact upload failed: {name}: {source}")]
    Backend {
        name: String,
        #[source]
        source: BackendError,
    },
}

/// A statically named artifact backed by a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSpec {
    pub name: String,
    pub file_name: String,
    pub kind: ArtifactKind,
}

impl ArtifactSpec {
    pub fn image(name: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file_name: file_name.into(),
            kind: ArtifactKind::Image,
        }
    }

    pub fn file(name: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file_name: file_name.into(),
            kind: ArtifactKind::File,
        }
    }

    /// Read the backing file and build the blob.
    pub fn load(&self, asset_dir: &Path) -> Result<ArtifactBlob, ArtifactUploadError> {
        let path = asset_dir.join(&self.file_name);
        let bytes = fs::read(&path).map_err(|source| ArtifactUploadError::Read {
            name: self.name.clone(),
            path: path.clone(),
            source,
        })?;
        if self.kind == ArtifactKind::Image && ImageFormat::sniff(&bytes).is_none() {
            return Err(ArtifactUploadError::NotAnImage {
                name: self.name.clone(),
                path,
            });
        }
        Ok(ArtifactBlob {
            name: self.name.clone(),
            kind: self.kind,
            file_name: self.file_name.clone(),
            bytes,
        })
    }
}

/// The fixed artifact set: one image and two auxiliary files.
pub fn default_artifacts() -> Vec<ArtifactSpec> {
    vec![
        ArtifactSpec::image("dancing_human_image", "dancing.jpg"),
        ArtifactSpec::file("args_json_file", "sample.json"),
        ArtifactSpec::file("args_csv_file", "data.csv"),
    ]
}

/// Upload one artifact to `handle`.
pub fn upload<H: RunHandle + ?Sized>(
    handle: &H,
    asset_dir: &Path,
    spec: &ArtifactSpec,
) -> Result<(), ArtifactUploadError> {
    let blob = spec.load(asset_dir)?;
    handle
        .upload_artifact(&blob)
        .map_err(|source| ArtifactUploadError::Backend {
            name: spec.name.clone(),
            source,
        })
}

/// Upload every artifact, turning failures into console warnings.
///
/// Returns the number of failed uploads.
pub fn upload_all<H: RunHandle + ?Sized>(
    handle: &H,
    asset_dir: &Path,
    specs: &[ArtifactSpec],
) -> usize {
    let mut failed = 0;
    for spec in specs {
        match upload(handle, asset_dir, spec) {
            Ok(()) => tracing::debug!(artifact = %spec.name, "artifact uploaded"),
            Err(err) => {
                failed += 1;
                tracing::warn!(artifact = %spec.name, error = %err, "artifact upload failed");
                if let Err(text_err) = handle.report_text(&err.to_string()) {
                    tracing::warn!(error = %text_err, "failed to report artifact warning");
                }
            }
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{RunRequest, TrackingBackend};
    use crate::mock::{Operation, RecordingBackend};

    fn request() -> RunRequest {
        RunRequest {
            project: "p".to_string(),
            name: "n".to_string(),
            tags: vec![],
        }
    }

    fn populate(dir: &Path) {
        fs::write(dir.join("dancing.jpg"), [0xffu8, 0xd8, 0xff, 0xdb]).unwrap();
        fs::write(dir.join("sample.json"), br#"{"lr": 0.1}"#).unwrap();
        fs::write(dir.join("data.csv"), b"a,b\n1,2\n").unwrap();
    }

    #[test]
    fn uploads_full_set() {
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path());
        let backend = RecordingBackend::new();
        let handle = backend.open_run(&request()).unwrap();

        assert_eq!(upload_all(&handle, dir.path(), &default_artifacts()), 0);
        let run = backend.last_run().unwrap();
        assert_eq!(
            run.artifacts(),
            vec!["dancing_human_image", "args_json_file", "args_csv_file"]
        );
        assert!(run.texts().is_empty());
    }

    #[test]
    fn missing_file_becomes_warning() {
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path());
        fs::remove_file(dir.path().join("data.csv")).unwrap();
        let backend = RecordingBackend::new();
        let handle = backend.open_run(&request()).unwrap();

        assert_eq!(upload_all(&handle, dir.path(), &default_artifacts()), 1);
        let run = backend.last_run().unwrap();
        assert_eq!(run.artifacts().len(), 2);
        let texts = run.texts();
        assert_eq!(texts.len(), 1);
        assert!(texts[0].starts_with("artifact upload failed: args_csv_file: cannot read"));
    }

    #[test]
    fn image_must_have_image_signature() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("dancing.jpg"), b"not really").unwrap();
        let err = default_artifacts()[0].load(dir.path()).unwrap_err();
        assert!(matches!(err, ArtifactUploadError::NotAnImage { .. }));
    }

    #[test]
    fn backend_rejection_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path());
        let backend = RecordingBackend::new().failing(Operation::Artifact);
        let handle = backend.open_run(&request()).unwrap();

        assert_eq!(upload_all(&handle, dir.path(), &default_artifacts()), 3);
        assert_eq!(backend.last_run().unwrap().texts().len(), 3);
    }
}
