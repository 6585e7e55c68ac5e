//! History report export. Writes operation-log lines to a CSV file and hands
//! back a link callers can download it from.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use segments_core::config::ReportsConfig;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("report storage is unavailable")]
    Unavailable,

    #[error("invalid report name '{0}'")]
    InvalidName(String),

    #[error("report write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Destination for exported history reports.
pub trait ReportUploader: Send + Sync {
    /// Whether uploads can currently succeed.
    fn is_available(&self) -> bool;

    /// Store `lines` as one CSV row each under `file_name` and return a link
    /// to the stored file.
    fn upload_and_link(&self, file_name: &str, lines: &[String]) -> Result<String, ReportError>;
}

/// Writes reports into a local directory served under `public_base_url`.
#[derive(Debug, Clone)]
pub struct LocalReportStore {
    export_dir: PathBuf,
    public_base_url: String,
}

impl LocalReportStore {
    pub fn new(export_dir: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            export_dir: export_dir.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &ReportsConfig) -> Self {
        Self::new(&config.export_dir, &config.public_base_url)
    }

    /// Create the export directory if it does not exist yet.
    pub fn prepare(&self) -> Result<(), ReportError> {
        fs::create_dir_all(&self.export_dir)?;
        info!(dir = %self.export_dir.display(), "Report export directory ready");
        Ok(())
    }

    fn link_for(&self, file_name: &str) -> String {
        format!("{}/{}", self.public_base_url, file_name)
    }
}

impl ReportUploader for LocalReportStore {
    fn is_available(&self) -> bool {
        match fs::metadata(&self.export_dir) {
            Ok(meta) => meta.is_dir() && !meta.permissions().readonly(),
            Err(_) => false,
        }
    }

    fn upload_and_link(&self, file_name: &str, lines: &[String]) -> Result<String, ReportError> {
        if file_name.is_empty() || file_name.contains(['/', '\\']) || file_name.starts_with('.') {
            return Err(ReportError::InvalidName(file_name.to_string()));
        }
        if !self.is_available() {
            warn!(dir = %self.export_dir.display(), "Report storage unavailable");
            return Err(ReportError::Unavailable);
        }

        let path = self.export_dir.join(file_name);
        let mut file = fs::File::create(&path)?;
        file.write_all(render_csv(lines).as_bytes())?;
        file.sync_all()?;

        info!(file = %file_name, rows = lines.len(), "Report exported");
        Ok(self.link_for(file_name))
    }
}

/// One CSV row per line, quoting fields that contain separators or quotes.
pub fn render_csv(lines: &[String]) -> String {
    let mut csv = String::new();
    for line in lines {
        csv.push_str(&csv_field(line));
        csv.push('\n');
    }
    csv
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
