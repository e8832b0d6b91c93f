//! Verification of files the application under test wrote to the upload directory

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{RestamentError, RunResult};
use crate::fixtures::copy_path;
use crate::scenario::{Scenario, UploadExpectation};
use crate::visual::ImageComparator;

pub struct UploadVerifier {
    comparator: Arc<dyn ImageComparator>,
    upload_dir: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    artifact_dir: PathBuf,
}

impl UploadVerifier {
    pub fn new(
        comparator: Arc<dyn ImageComparator>,
        upload_dir: Option<PathBuf>,
        log_dir: Option<PathBuf>,
        artifact_dir: PathBuf,
    ) -> Self {
        Self {
            comparator,
            upload_dir,
            log_dir,
            artifact_dir,
        }
    }

    /// Check every expected upload of every table expectation, in order
    pub async fn verify(&self, scenario: &Scenario) -> RunResult<()> {
        for table in &scenario.db {
            let Some(result) = &table.result else { continue };
            for upload in &result.uploads {
                self.verify_upload(upload).await?;
            }
        }
        Ok(())
    }

    /// Compare `<uploadDir>/<filename>` with the reference image.
    ///
    /// On a mismatch or a comparison error both files are copied into the
    /// artifact directory (`uploaded/` and `expected/`) before failing.
    pub async fn verify_upload(&self, upload: &UploadExpectation) -> RunResult<()> {
        let upload_dir = self.upload_dir.as_deref().ok_or_else(|| {
            RestamentError::Config(
                "scenario expects uploaded files but `upload_dir` is not configured".to_string(),
            )
        })?;
        let uploaded = upload_dir.join(&upload.filename);
        let diff_out = self
            .log_dir
            .as_ref()
            .map(|dir| dir.join("images").join("diff").join(diff_name(&upload.filename)));

        let outcome = self
            .comparator
            .compare(&uploaded, &upload.original, diff_out.as_deref())
            .await;

        match outcome {
            Ok(true) => {
                info!("Upload {} matches {}", upload.filename, upload.original.display());
                Ok(())
            }
            Ok(false) => {
                self.preserve_artifacts(&uploaded, upload).await?;
                Err(RestamentError::UploadMismatch {
                    filename: upload.filename.clone(),
                    original: upload.original.clone(),
                })
            }
            Err(e) => {
                self.preserve_artifacts(&uploaded, upload).await?;
                Err(RestamentError::ImageCompare {
                    filename: upload.filename.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Copy whichever of the two files exist for inspection.
    ///
    /// A missing file is reported as such rather than as a mismatch.
    async fn preserve_artifacts(
        &self,
        uploaded: &Path,
        upload: &UploadExpectation,
    ) -> RunResult<()> {
        let name = artifact_name(&upload.filename);
        let uploaded_exists = tokio::fs::try_exists(uploaded).await?;
        let expected_exists = tokio::fs::try_exists(&upload.original).await?;

        if uploaded_exists {
            copy_path(uploaded, &self.artifact_dir.join("uploaded").join(&name)).await?;
        }
        if expected_exists {
            copy_path(&upload.original, &self.artifact_dir.join("expected").join(&name)).await?;
        }
        warn!(
            "Saved mismatching images for {} under {}",
            upload.filename,
            self.artifact_dir.display()
        );

        if !uploaded_exists {
            return Err(RestamentError::FileMissing(uploaded.to_path_buf()));
        }
        if !expected_exists {
            return Err(RestamentError::FileMissing(upload.original.clone()));
        }
        Ok(())
    }
}

/// Flatten nested upload paths into one artifact file name
fn artifact_name(filename: &str) -> String {
    filename.replace(['/', '\\'], "_")
}

/// Diffs are always PNG, whatever the uploaded format
fn diff_name(filename: &str) -> PathBuf {
    Path::new(&artifact_name(filename)).with_extension("png")
}
