//! Conversion results and batch reports.

use crate::histogram::NormalizationMetadata;
use crate::pipeline::ConversionState;
use crate::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Outcome of one texture conversion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionResult {
    /// Input description (source path, or the packed lanes)
    pub source: String,
    pub success: bool,
    /// Last state reached
    pub state: ConversionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    pub mip_levels: u32,
    pub toksvig_applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalization: Option<NormalizationMetadata>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConversionResult {
    pub fn succeeded(source: impl Into<String>, output_path: PathBuf, mip_levels: u32) -> Self {
        Self {
            source: source.into(),
            success: true,
            state: ConversionState::Done,
            output_path: Some(output_path),
            mip_levels,
            toksvig_applied: false,
            normalization: None,
            warnings: Vec::new(),
            error: None,
        }
    }

    pub fn failed(source: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            success: false,
            state: ConversionState::Failed,
            output_path: None,
            mip_levels: 0,
            toksvig_applied: false,
            normalization: None,
            warnings: Vec::new(),
            error: Some(error.into()),
        }
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }
}

/// Per-texture results of a batch, in job order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    /// RFC 3339 timestamp
    pub generated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<ConversionResult>,
}

impl BatchReport {
    pub fn new(preset: Option<String>, results: Vec<ConversionResult>) -> Self {
        let succeeded = results.iter().filter(|r| r.success).count();
        Self {
            generated_at: Utc::now().to_rfc3339(),
            preset,
            total: results.len(),
            succeeded,
            failed: results.len() - succeeded,
            results,
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}
