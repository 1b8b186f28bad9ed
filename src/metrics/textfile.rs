//! Prometheus textfile export
//!
//! Writes the default registry in the text exposition format so that a
//! node-exporter textfile collector can pick up the metrics of a finished
//! run.
//!
//! # Example
//!
//! ```no_run
//! use kumo_uploadr::metrics::textfile;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! textfile::write("/var/lib/node_exporter/kumo.prom")?;
//! # Ok(())
//! # }
//! ```

use prometheus::{Encoder, TextEncoder};
use std::io::Write;
use std::path::Path;

/// Textfile export error
#[derive(Debug, thiserror::Error)]
pub enum TextfileError {
    #[error("Encoding error: {0}")]
    EncodeError(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Render every registered metric in the text exposition format
pub fn render() -> Result<String, TextfileError> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

/// Write the metrics to `path`.
///
/// The content goes to a sibling temporary file first and is renamed into
/// place, so a collector never reads a half-written file.
pub fn write(path: impl AsRef<Path>) -> Result<(), TextfileError> {
    let path = path.as_ref();
    let body = render()?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = Path::new(&tmp);

    let mut file = std::fs::File::create(tmp)?;
    file.write_all(body.as_bytes())?;
    file.sync_all()?;
    std::fs::rename(tmp, path)?;

    tracing::debug!(path = %path.display(), bytes = body.len(), "Wrote metrics textfile");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics;

    #[test]
    fn test_render_contains_upload_metrics() {
        metrics::record_upload_success("multipart", 10);
        let text = render().unwrap();
        assert!(text.contains("kumo_uploads_total"));
    }

    #[test]
    fn test_write_textfile() {
        metrics::record_abort(true);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kumo.prom");

        write(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("kumo_aborts_total"));
        assert!(!dir.path().join("kumo.prom.tmp").exists());
    }
}
