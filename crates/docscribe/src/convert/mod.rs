//! Markdown to document conversion through an external `pandoc` binary.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{Classify, ErrorClass};

pub const DEFAULT_PANDOC: &str = "pandoc";
pub const DEFAULT_OUTPUT_FORMAT: &str = "docx";

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("Failed to run '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Document conversion failed: {0}")]
    Failed(String),

    #[error("Markdown file not found: {0}")]
    InputMissing(PathBuf),
}

impl Classify for ConvertError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Permanent
    }
}

#[async_trait]
pub trait DocumentConverter: Send + Sync {
    /// Converts `markdown` into `output` and returns the produced path.
    async fn convert(&self, markdown: &Path, output: &Path) -> Result<PathBuf, ConvertError>;

    /// File extension of the produced documents.
    fn output_extension(&self) -> &str;
}

fn format_failure(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();

    match (stderr.is_empty(), stdout.is_empty()) {
        (true, true) => format!(
            "pandoc exited with code {}",
            output.status.code().unwrap_or(-1)
        ),
        (true, false) => stdout,
        (false, true) => stderr,
        (false, false) => format!("{}\n{}", stderr, stdout),
    }
}

pub struct PandocConverter {
    program: String,
    reference_template: Option<PathBuf>,
    output_format: String,
}

impl PandocConverter {
    pub fn new(
        program: Option<&str>,
        reference_template: Option<PathBuf>,
        output_format: Option<&str>,
    ) -> Self {
        Self {
            program: program.unwrap_or(DEFAULT_PANDOC).to_string(),
            reference_template,
            output_format: output_format.unwrap_or(DEFAULT_OUTPUT_FORMAT).to_string(),
        }
    }

    fn args(&self, markdown: &Path, output: &Path) -> Vec<String> {
        let mut args = vec![
            markdown.display().to_string(),
            "-o".to_string(),
            output.display().to_string(),
        ];
        if let Some(template) = &self.reference_template {
            args.push(format!("--reference-doc={}", template.display()));
        }
        args
    }
}

#[async_trait]
impl DocumentConverter for PandocConverter {
    async fn convert(&self, markdown: &Path, output: &Path) -> Result<PathBuf, ConvertError> {
        if tokio::fs::metadata(markdown).await.is_err() {
            return Err(ConvertError::InputMissing(markdown.to_path_buf()));
        }

        let args = self.args(markdown, output);
        debug!(program = %self.program, ?args, "Running converter");

        let result = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ConvertError::Spawn {
                program: self.program.clone(),
                source: e,
            })?;

        if !result.status.success() {
            return Err(ConvertError::Failed(format_failure(&result)));
        }

        info!(output = %crate::sanitize::redact_path(output), "Document converted");
        Ok(output.to_path_buf())
    }

    fn output_extension(&self) -> &str {
        &self.output_format
    }
}
