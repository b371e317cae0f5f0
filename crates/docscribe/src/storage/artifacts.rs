use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::StorageError;
use crate::job::ArtifactKind;

/// Move a file from `src` to `dst`. Uses `rename` first (atomic on the same
/// filesystem) and falls back to copy + delete for cross-device moves.
fn move_file(src: &Path, dst: &Path) -> Result<(), StorageError> {
    if std::fs::rename(src, dst).is_ok() {
        return Ok(());
    }

    std::fs::copy(src, dst).map_err(|e| StorageError::MoveFile {
        from: src.to_path_buf(),
        to: dst.to_path_buf(),
        source: e,
    })?;
    std::fs::remove_file(src).map_err(|e| StorageError::MoveFile {
        from: src.to_path_buf(),
        to: dst.to_path_buf(),
        source: e,
    })?;
    Ok(())
}

/// Stem used for artifact file names: the source file stem with anything
/// outside `[A-Za-z0-9._-]` replaced by `_`.
pub fn artifact_stem(source_ref: &str) -> String {
    let last = source_ref
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(source_ref);
    let last = last.split(['?', '#']).next().unwrap_or(last);
    let stem = Path::new(last)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("");

    let cleaned: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();

    if cleaned.is_empty() {
        "audio".to_string()
    } else {
        cleaned
    }
}

/// Per-job artifact layout: `<root>/<job_id>/<stem>.<ext>`.
pub struct ArtifactStore {
    root: PathBuf,
    document_extension: String,
}

impl ArtifactStore {
    pub fn new<P: AsRef<Path>>(root: P, document_extension: &str) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            document_extension: document_extension.trim_start_matches('.').to_string(),
        }
    }

    pub fn job_directory(&self, job_id: &str) -> PathBuf {
        self.root.join(job_id)
    }

    fn extension(&self, kind: ArtifactKind) -> &str {
        match kind {
            ArtifactKind::Transcript => "txt",
            ArtifactKind::Proofread => "md",
            ArtifactKind::Document => &self.document_extension,
        }
    }

    /// Where the artifact of `kind` lives for this job.
    pub fn path_for(&self, job_id: &str, source_ref: &str, kind: ArtifactKind) -> PathBuf {
        self.job_directory(job_id).join(format!(
            "{}.{}",
            artifact_stem(source_ref),
            self.extension(kind)
        ))
    }

    /// Prepares the job directory for a stage that writes its own output
    /// (the converter) and returns the target path.
    pub fn prepare(
        &self,
        job_id: &str,
        source_ref: &str,
        kind: ArtifactKind,
    ) -> Result<PathBuf, StorageError> {
        self.ensure_directory(&self.job_directory(job_id))?;
        Ok(self.path_for(job_id, source_ref, kind))
    }

    /// Writes an artifact through a temporary file and a rename, so readers
    /// never see a partially written file. Overwrites a previous attempt.
    pub fn write(
        &self,
        job_id: &str,
        source_ref: &str,
        kind: ArtifactKind,
        content: &[u8],
    ) -> Result<PathBuf, StorageError> {
        let target = self.prepare(job_id, source_ref, kind)?;
        let tmp = target.with_extension(format!("{}.partial", self.extension(kind)));

        let mut file = std::fs::File::create(&tmp).map_err(|e| StorageError::WriteFile {
            path: tmp.clone(),
            source: e,
        })?;
        file.write_all(content)
            .and_then(|_| file.sync_all())
            .map_err(|e| StorageError::WriteFile {
                path: tmp.clone(),
                source: e,
            })?;
        drop(file);

        move_file(&tmp, &target)?;
        Ok(target)
    }

    pub fn read(&self, path: &Path) -> Result<Vec<u8>, StorageError> {
        std::fs::read(path).map_err(|e| StorageError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn read_to_string(&self, path: &Path) -> Result<String, StorageError> {
        std::fs::read_to_string(path).map_err(|e| StorageError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })
    }

    fn ensure_directory(&self, path: &Path) -> Result<(), StorageError> {
        if !path.exists() {
            std::fs::create_dir_all(path).map_err(|e| StorageError::CreateDirectory {
                path: path.to_path_buf(),
                source: e,
            })?;
        }
        Ok(())
    }
}
