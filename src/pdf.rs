//! Optional PDF rendering via an external Markdown converter.
//!
//! The capability is resolved once at startup: if no converter binary is
//! on PATH the worker simply runs without PDF output. Conversion always
//! starts from the already-rendered Markdown report, so PDF content can
//! never drift from the Markdown content.

use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;

/// Converter binaries probed in order.
const CONVERTERS: &[&str] = &["pandoc"];

#[derive(Debug, Error)]
pub enum PdfError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("PDF converter exited with {status}: {stderr}")]
    ConverterFailed { status: i32, stderr: String },
}

pub struct PdfRenderer {
    converter: PathBuf,
}

impl PdfRenderer {
    /// Probe for a usable converter. `None` disables the capability.
    pub fn detect() -> Option<Self> {
        for name in CONVERTERS {
            let probe = Command::new(name).arg("--version").output();
            if matches!(probe, Ok(ref out) if out.status.success()) {
                log::info!("PDF generation enabled ({})", name);
                return Some(Self {
                    converter: PathBuf::from(name),
                });
            }
        }
        None
    }

    /// Convert a rendered Markdown report to PDF.
    pub fn render(&self, markdown_path: &Path, pdf_path: &Path) -> Result<(), PdfError> {
        if let Some(parent) = pdf_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let output = Command::new(&self.converter)
            .arg(markdown_path)
            .arg("-o")
            .arg(pdf_path)
            .output()?;

        if !output.status.success() {
            return Err(PdfError::ConverterFailed {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_missing_converter_is_io_error() {
        let renderer = PdfRenderer {
            converter: PathBuf::from("definitely-not-a-real-converter"),
        };
        let dir = tempfile::tempdir().unwrap();
        let md = dir.path().join("in.md");
        std::fs::write(&md, "# hi").unwrap();
        let err = renderer.render(&md, &dir.path().join("out.pdf")).unwrap_err();
        assert!(matches!(err, PdfError::Io(_)));
    }
}
