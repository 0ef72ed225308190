//! Resumable model uploads.
//!
//! Sessions are keyed by a deterministic id derived from the file name
//! and declared size, so a client that lost its state resumes by
//! re-issuing init. Finalize verifies the tar against a separately
//! uploaded checksum before anything lands under the models directory.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::PathBuf;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const SESSION_DIR: &str = ".tmp";

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Upload session not found")]
    SessionNotFound,
    #[error("Invalid model name")]
    InvalidName,
    #[error("Checksum mismatch! Expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct InitRequest {
    pub filename: String,
    pub total_size: u64,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct InitResponse {
    pub upload_id: String,
    pub existing: bool,
    pub offset: u64,
}

#[derive(Debug, Deserialize)]
pub struct FinalizeRequest {
    pub model_name: String,
    pub tar_upload_id: String,
    pub checksum_upload_id: String,
}

#[derive(Debug, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub size: u64,
    pub updated_at: String,
}

#[derive(Clone)]
pub struct UploadManager {
    models_dir: PathBuf,
}

impl UploadManager {
    pub fn new(models_dir: PathBuf) -> Self {
        Self { models_dir }
    }

    fn session_dir(&self, upload_id: &str) -> PathBuf {
        self.models_dir.join(SESSION_DIR).join(upload_id)
    }

    fn data_file(&self, upload_id: &str) -> PathBuf {
        self.session_dir(upload_id).join("data")
    }

    /// Deterministic session id: the same (filename, size) pair always
    /// maps to the same session, which is what makes resume work.
    pub fn upload_id(filename: &str, total_size: u64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(filename.as_bytes());
        hasher.update(total_size.to_string().as_bytes());
        hex::encode(hasher.finalize())[..16].to_string()
    }

    pub fn init(&self, req: &InitRequest) -> Result<InitResponse, UploadError> {
        let upload_id = Self::upload_id(&req.filename, req.total_size);
        let session = self.session_dir(&upload_id);
        let data = self.data_file(&upload_id);

        if session.exists() {
            let offset = std::fs::metadata(&data).map(|m| m.len()).unwrap_or(0);
            return Ok(InitResponse {
                upload_id,
                existing: offset > 0,
                offset,
            });
        }

        std::fs::create_dir_all(&session)
            .with_context(|| format!("creating session {}", session.display()))?;
        let meta = serde_json::json!({"filename": req.filename, "total_size": req.total_size});
        std::fs::write(session.join("meta.json"), meta.to_string())
            .context("writing session metadata")?;
        Ok(InitResponse {
            upload_id,
            existing: false,
            offset: 0,
        })
    }

    /// Appends one chunk, returning the new end offset.
    pub fn append_chunk(&self, upload_id: &str, chunk: &[u8]) -> Result<u64, UploadError> {
        let session = self.session_dir(upload_id);
        if !session.exists() {
            return Err(UploadError::SessionNotFound);
        }
        let data = self.data_file(upload_id);
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&data)
            .with_context(|| format!("opening {}", data.display()))?;
        file.write_all(chunk).context("appending chunk")?;
        Ok(file.metadata().context("reading data size")?.len())
    }

    /// Verifies the uploaded tar against the uploaded checksum and
    /// moves it into place. Both sessions are discarded regardless of
    /// outcome, so a mismatch leaves nothing behind.
    pub fn finalize(&self, req: &FinalizeRequest) -> Result<PathBuf, UploadError> {
        if !valid_model_name(&req.model_name) {
            return Err(UploadError::InvalidName);
        }

        let tar_session = self.session_dir(&req.tar_upload_id);
        let sum_session = self.session_dir(&req.checksum_upload_id);
        let result = self.verify_and_install(req, &tar_session, &sum_session);
        std::fs::remove_dir_all(&tar_session).ok();
        std::fs::remove_dir_all(&sum_session).ok();
        result
    }

    fn verify_and_install(
        &self,
        req: &FinalizeRequest,
        tar_session: &PathBuf,
        sum_session: &PathBuf,
    ) -> Result<PathBuf, UploadError> {
        let tar_path = tar_session.join("data");
        let sum_path = sum_session.join("data");
        if !tar_path.exists() || !sum_path.exists() {
            return Err(UploadError::SessionNotFound);
        }

        let sum_raw = std::fs::read_to_string(&sum_path).context("reading checksum upload")?;
        let expected = sum_raw
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_string();
        let tar_bytes = std::fs::read(&tar_path).context("reading tar upload")?;
        let actual = hex::encode(Sha256::digest(&tar_bytes));

        if !actual.eq_ignore_ascii_case(&expected) {
            return Err(UploadError::ChecksumMismatch { expected, actual });
        }

        let mut final_name = req.model_name.clone();
        if !final_name.to_lowercase().ends_with(".tar") {
            final_name.push_str(".tar");
        }
        std::fs::create_dir_all(&self.models_dir)
            .with_context(|| format!("creating {}", self.models_dir.display()))?;
        let dest = self.models_dir.join(&final_name);
        std::fs::rename(&tar_path, &dest)
            .with_context(|| format!("installing {}", dest.display()))?;
        std::fs::write(dest.with_extension("tar.sha256"), &expected)
            .context("writing checksum alongside model")?;
        Ok(dest)
    }

    pub fn list(&self) -> Result<Vec<ModelInfo>, UploadError> {
        std::fs::create_dir_all(&self.models_dir)
            .with_context(|| format!("creating {}", self.models_dir.display()))?;
        let mut models = Vec::new();
        for entry in
            std::fs::read_dir(&self.models_dir).context("reading models directory")?
        {
            let entry = entry.context("reading directory entry")?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !name.to_lowercase().ends_with(".tar") {
                continue;
            }
            let meta = entry.metadata().context("reading model metadata")?;
            let updated_at = meta
                .modified()
                .ok()
                .map(|t| OffsetDateTime::from(t).format(&Rfc3339).unwrap_or_default())
                .unwrap_or_default();
            models.push(ModelInfo {
                name,
                size: meta.len(),
                updated_at,
            });
        }
        models.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(models)
    }

    pub fn delete(&self, name: &str) -> Result<(), UploadError> {
        if !valid_model_name(name) {
            return Err(UploadError::InvalidName);
        }
        let path = self.models_dir.join(name);
        std::fs::remove_file(&path)
            .with_context(|| format!("removing {}", path.display()))?;
        std::fs::remove_file(path.with_extension("tar.sha256")).ok();
        Ok(())
    }
}

/// Model names become file names directly, so anything that could
/// escape the models directory is rejected.
fn valid_model_name(name: &str) -> bool {
    !name.is_empty() && !name.contains("..") && !name.contains('/') && !name.contains('\\')
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMMY_SUM: &str = "bf0ecbdb9b814248d086c9b69cf26182d9d4138f2ad3d0637c4555fc8cbf68e5";

    fn manager() -> (tempfile::TempDir, UploadManager) {
        let dir = tempfile::tempdir().unwrap();
        let mgr = UploadManager::new(dir.path().join("models"));
        (dir, mgr)
    }

    fn upload(mgr: &UploadManager, filename: &str, content: &[u8]) -> String {
        let init = mgr
            .init(&InitRequest {
                filename: filename.to_string(),
                total_size: content.len() as u64,
            })
            .unwrap();
        mgr.append_chunk(&init.upload_id, content).unwrap();
        init.upload_id
    }

    #[test]
    fn init_is_deterministic_and_reports_resume_offset() {
        let (_dir, mgr) = manager();
        let first = mgr
            .init(&InitRequest {
                filename: "m.tar".to_string(),
                total_size: 13,
            })
            .unwrap();
        assert_eq!(first.upload_id.len(), 16);
        assert!(!first.existing);
        assert_eq!(first.offset, 0);

        let offset = mgr.append_chunk(&first.upload_id, b"dummy ").unwrap();
        assert_eq!(offset, 6);
        let offset = mgr.append_chunk(&first.upload_id, b"content").unwrap();
        assert_eq!(offset, 13);

        let resumed = mgr
            .init(&InitRequest {
                filename: "m.tar".to_string(),
                total_size: 13,
            })
            .unwrap();
        assert_eq!(resumed.upload_id, first.upload_id);
        assert!(resumed.existing);
        assert_eq!(resumed.offset, 13);
    }

    #[test]
    fn chunk_against_unknown_session_is_rejected() {
        let (_dir, mgr) = manager();
        assert!(matches!(
            mgr.append_chunk("deadbeefdeadbeef", b"x"),
            Err(UploadError::SessionNotFound)
        ));
    }

    #[test]
    fn finalize_installs_tar_and_checksum_on_match() {
        let (_dir, mgr) = manager();
        let tar_id = upload(&mgr, "m.tar", b"dummy content");
        let sum_id = upload(&mgr, "m.tar.sha256", format!("{DUMMY_SUM}  m.tar").as_bytes());

        let dest = mgr
            .finalize(&FinalizeRequest {
                model_name: "test-model".to_string(),
                tar_upload_id: tar_id,
                checksum_upload_id: sum_id,
            })
            .unwrap();
        assert!(dest.ends_with("test-model.tar"));
        assert_eq!(std::fs::read(&dest).unwrap(), b"dummy content");
        assert_eq!(
            std::fs::read_to_string(dest.with_extension("tar.sha256")).unwrap(),
            DUMMY_SUM
        );
        let listed = mgr.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "test-model.tar");
    }

    #[test]
    fn finalize_mismatch_discards_everything() {
        let (_dir, mgr) = manager();
        let tar_id = upload(&mgr, "m.tar", b"dummy content");
        let sum_id = upload(&mgr, "m.tar.sha256", b"0000000000000000");

        let err = mgr
            .finalize(&FinalizeRequest {
                model_name: "test-model".to_string(),
                tar_upload_id: tar_id.clone(),
                checksum_upload_id: sum_id,
            })
            .unwrap_err();
        assert!(matches!(err, UploadError::ChecksumMismatch { .. }));
        assert!(mgr.list().unwrap().is_empty());
        // The sessions are gone; a retry must restart from scratch.
        assert!(matches!(
            mgr.append_chunk(&tar_id, b"x"),
            Err(UploadError::SessionNotFound)
        ));
    }

    #[test]
    fn traversal_names_are_rejected() {
        let (_dir, mgr) = manager();
        for name in ["../evil", "a/b", "a\\b", ""] {
            assert!(matches!(
                mgr.finalize(&FinalizeRequest {
                    model_name: name.to_string(),
                    tar_upload_id: "x".to_string(),
                    checksum_upload_id: "y".to_string(),
                }),
                Err(UploadError::InvalidName)
            ));
            assert!(matches!(mgr.delete(name), Err(UploadError::InvalidName)));
        }
    }
}
