//! On-disk image artifacts: the captured image and an annotated copy with
//! detection boxes drawn on it. Records reference them by path.

use std::fs::OpenOptions;
use std::io::{Cursor, ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use image::{ImageFormat, Rgb, RgbImage};

use crate::aggregate::Category;
use crate::config::ArtifactSettings;
use crate::detect::Detection;
use crate::error::{InspectError, Result};
use crate::ingest::AcquiredImage;
use crate::record::ChamberId;

const BOX_THICKNESS: u32 = 2;
const MAX_NAME_ATTEMPTS: u32 = 100;

/// Paths of the files written for one session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactRefs {
    pub image_ref: String,
    pub result_image_ref: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ArtifactStore {
    upload_dir: PathBuf,
    result_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(upload_dir: impl Into<PathBuf>, result_dir: impl Into<PathBuf>) -> Self {
        Self {
            upload_dir: upload_dir.into(),
            result_dir: result_dir.into(),
        }
    }

    pub fn from_settings(settings: &ArtifactSettings) -> Self {
        Self::new(settings.upload_dir.clone(), settings.result_dir.clone())
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    pub fn result_dir(&self) -> &Path {
        &self.result_dir
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.upload_dir, &self.result_dir] {
            std::fs::create_dir_all(dir).map_err(|e| {
                InspectError::persistence(&format!("cannot create {}", dir.display()), e)
            })?;
        }
        Ok(())
    }

    /// Write the captured image and, if given, the annotated PNG.
    ///
    /// Names are `capture_{chamber}_{YYYYmmdd_HHMMSS}.{ext}` and
    /// `result_{chamber}_{YYYYmmdd_HHMMSS}.png`; an existing file is never
    /// overwritten, a numeric suffix is added instead.
    pub fn save(
        &self,
        chamber: &ChamberId,
        image: &AcquiredImage,
        annotated: Option<&[u8]>,
        at: DateTime<Utc>,
    ) -> Result<ArtifactRefs> {
        self.ensure_dirs()?;
        let stem = format!(
            "{}_{}",
            sanitize_component(chamber.as_str()),
            at.format("%Y%m%d_%H%M%S")
        );
        let image_path = write_unique(
            &self.upload_dir,
            &format!("capture_{stem}"),
            image.extension(),
            image.bytes(),
        )?;
        let result_path = match annotated {
            Some(bytes) => Some(write_unique(
                &self.result_dir,
                &format!("result_{stem}"),
                "png",
                bytes,
            )?),
            None => None,
        };
        log::debug!(
            "saved artifacts for {}: {}{}",
            chamber,
            image_path.display(),
            result_path
                .as_ref()
                .map(|p| format!(", {}", p.display()))
                .unwrap_or_default()
        );
        Ok(ArtifactRefs {
            image_ref: image_path.display().to_string(),
            result_image_ref: result_path.map(|p| p.display().to_string()),
        })
    }
}

fn write_unique(dir: &Path, stem: &str, ext: &str, bytes: &[u8]) -> Result<PathBuf> {
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let name = if attempt == 0 {
            format!("{stem}.{ext}")
        } else {
            format!("{stem}_{attempt}.{ext}")
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(bytes)
                    .and_then(|_| file.sync_all())
                    .map_err(|e| {
                        InspectError::persistence(&format!("cannot write {}", path.display()), e)
                    })?;
                return Ok(path);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(InspectError::persistence(
                    &format!("cannot create {}", path.display()),
                    e,
                ))
            }
        }
    }
    Err(InspectError::Persistence(format!(
        "too many artifacts named {stem} in {}",
        dir.display()
    )))
}

/// Replace anything outside `[A-Za-z0-9_-]` so a chamber id is safe in a file name.
pub fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn box_color(class_id: u32) -> Rgb<u8> {
    match Category::for_class(class_id) {
        Category::Missing => Rgb([220, 30, 30]),
        Category::Good => Rgb([30, 200, 60]),
        Category::Other => Rgb([240, 200, 20]),
    }
}

/// Draw detection boxes on the image and return it re-encoded as PNG.
pub fn annotate(image: &[u8], detections: &[Detection]) -> Result<Vec<u8>> {
    let mut canvas = image::load_from_memory(image)
        .map_err(|e| InspectError::Acquisition(format!("cannot decode image: {e}")))?
        .to_rgb8();
    for detection in detections {
        draw_box(&mut canvas, detection, box_color(detection.class_id));
    }
    let mut out = Cursor::new(Vec::new());
    canvas
        .write_to(&mut out, ImageFormat::Png)
        .map_err(|e| InspectError::persistence("cannot encode annotated image", e))?;
    Ok(out.into_inner())
}

fn draw_box(canvas: &mut RgbImage, detection: &Detection, color: Rgb<u8>) {
    let (w, h) = canvas.dimensions();
    if w == 0 || h == 0 {
        return;
    }
    let clamp = |v: f32, max: u32| -> u32 { v.max(0.0).min((max - 1) as f32) as u32 };
    let b = &detection.bbox;
    let (x1, y1) = (clamp(b.x1, w), clamp(b.y1, h));
    let (x2, y2) = (clamp(b.x2, w), clamp(b.y2, h));

    for t in 0..BOX_THICKNESS {
        for x in x1..=x2 {
            put(canvas, x, y1.saturating_add(t), color);
            put(canvas, x, y2.saturating_sub(t), color);
        }
        for y in y1..=y2 {
            put(canvas, x1.saturating_add(t), y, color);
            put(canvas, x2.saturating_sub(t), y, color);
        }
    }
}

fn put(canvas: &mut RgbImage, x: u32, y: u32, color: Rgb<u8>) {
    if x < canvas.width() && y < canvas.height() {
        canvas.put_pixel(x, y, color);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;
    use crate::ingest::test_images;
    use chrono::TimeZone;

    #[test]
    fn sanitize_replaces_path_characters() {
        assert_eq!(sanitize_component("A1/../02 x"), "A1____02_x");
        assert_eq!(sanitize_component("bay-3_b"), "bay-3_b");
    }

    #[test]
    fn annotate_colors_by_category() {
        let png = test_images::png(20, 20);
        let dets = vec![
            Detection::new(0, 0.9, BoundingBox::new(2.0, 2.0, 8.0, 8.0)),
            Detection::new(1, 0.9, BoundingBox::new(10.0, 10.0, 18.0, 18.0)),
        ];
        let out = annotate(&png, &dets).unwrap();
        let img = image::load_from_memory(&out).unwrap().to_rgb8();
        assert_eq!(*img.get_pixel(2, 5), Rgb([220, 30, 30]));
        assert_eq!(*img.get_pixel(10, 14), Rgb([30, 200, 60]));
        assert_eq!(*img.get_pixel(5, 5), Rgb([90, 90, 90]));
    }

    #[test]
    fn annotate_clamps_out_of_frame_boxes() {
        let png = test_images::png(10, 10);
        let dets = vec![Detection::new(4, 0.5, BoundingBox::new(-5.0, -5.0, 50.0, 50.0))];
        let img = image::load_from_memory(&annotate(&png, &dets).unwrap())
            .unwrap()
            .to_rgb8();
        assert_eq!(*img.get_pixel(0, 0), Rgb([240, 200, 20]));
        assert_eq!(*img.get_pixel(9, 9), Rgb([240, 200, 20]));
    }

    #[test]
    fn save_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("uploads"), dir.path().join("results"));
        let chamber = ChamberId::parse("A1-01").unwrap();
        let image = AcquiredImage::new(test_images::png(4, 4), "test").unwrap();
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap();

        let first = store.save(&chamber, &image, Some(image.bytes()), at).unwrap();
        let second = store.save(&chamber, &image, None, at).unwrap();

        assert!(first.image_ref.ends_with("capture_A1-01_20240305_140709.png"));
        assert!(first
            .result_image_ref
            .as_deref()
            .unwrap()
            .ends_with("result_A1-01_20240305_140709.png"));
        assert!(second.image_ref.ends_with("capture_A1-01_20240305_140709_1.png"));
        assert!(second.result_image_ref.is_none());
        assert!(Path::new(&first.image_ref).exists());
    }
}
