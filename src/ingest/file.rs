//! Local file image source.
//!
//! Reads one still image from a local path. URL schemes are refused; remote
//! fetching is not part of acquisition.

use std::path::PathBuf;

use super::{AcquiredImage, ImageSource};
use crate::error::{InspectError, Result};

#[derive(Clone, Debug)]
pub struct FileImageSource {
    path: PathBuf,
}

impl FileImageSource {
    pub fn new(path: &str) -> Result<Self> {
        if !is_local_file_path(path) {
            return Err(InspectError::Acquisition(format!(
                "'{path}' is not a local file path (no URL schemes)"
            )));
        }
        Ok(Self {
            path: PathBuf::from(path.trim()),
        })
    }
}

impl ImageSource for FileImageSource {
    fn acquire(&mut self) -> Result<AcquiredImage> {
        let bytes = std::fs::read(&self.path).map_err(|e| {
            InspectError::Acquisition(format!("cannot read {}: {e}", self.path.display()))
        })?;
        log::debug!("read {} bytes from {}", bytes.len(), self.path.display());
        AcquiredImage::new(bytes, self.path.display().to_string())
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }
}

fn is_local_file_path(path: &str) -> bool {
    if path.trim().is_empty() {
        return false;
    }
    !path.contains("://")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::test_images;

    #[test]
    fn file_source_rejects_urls() {
        assert!(FileImageSource::new("http://example.com/a.jpg").is_err());
        assert!(FileImageSource::new("  ").is_err());
        assert!(FileImageSource::new("/var/lib/chamber/a.jpg").is_ok());
    }

    #[test]
    fn missing_file_is_acquisition_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.png");
        let mut source = FileImageSource::new(path.to_str().unwrap()).unwrap();
        assert!(matches!(source.acquire(), Err(InspectError::Acquisition(_))));
    }

    #[test]
    fn reads_local_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chamber.png");
        std::fs::write(&path, test_images::png(8, 6)).unwrap();
        let mut source = FileImageSource::new(path.to_str().unwrap()).unwrap();
        let image = source.acquire().unwrap();
        assert_eq!(image.extension(), "png");
        assert!(source.describe().contains("chamber.png"));
    }
}
