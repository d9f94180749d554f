#![cfg(feature = "backend-tract")]

use std::path::Path;

use image::imageops::FilterType;
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{non_max_suppression, BoundingBox, Detection};
use crate::error::{InspectError, Result};

/// Tract-based backend for YOLO-style ONNX detectors.
///
/// Expects a single `[1, 3, S, S]` f32 input and a `[1, 4 + classes, anchors]`
/// output (center/size box followed by per-class scores), the layout exported
/// by YOLOv8 heads. Boxes are rescaled to source-image pixels.
pub struct TractBackend {
    model: TypedRunnableModel<TypedModel>,
    input_size: u32,
    confidence_threshold: f32,
    iou_threshold: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let side = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .map_err(|e| {
                unavailable(&format!("failed to load {}", model_path.display()), e)
            })?
            .with_input_fact(0, f32::fact([1, 3, side, side]).into())
            .map_err(|e| unavailable("failed to set input fact", e))?
            .into_optimized()
            .map_err(|e| unavailable("failed to optimize model", e))?
            .into_runnable()
            .map_err(|e| unavailable("failed to build runnable model", e))?;

        log::info!(
            "tract backend loaded {} (input {}x{})",
            model_path.display(),
            input_size,
            input_size
        );

        Ok(Self {
            model,
            input_size,
            confidence_threshold: 0.25,
            iou_threshold: 0.45,
        })
    }

    pub fn with_thresholds(mut self, confidence: f32, iou: f32) -> Self {
        self.confidence_threshold = confidence;
        self.iou_threshold = iou;
        self
    }

    fn build_input(&self, pixels: &[u8], width: u32, height: u32) -> Result<TValue> {
        let image = RgbImage::from_raw(width, height, pixels.to_vec()).ok_or_else(|| {
            InspectError::Acquisition(format!(
                "pixel buffer of {} bytes does not match {}x{} RGB",
                pixels.len(),
                width,
                height
            ))
        })?;
        let resized = image::imageops::resize(
            &image,
            self.input_size,
            self.input_size,
            FilterType::Triangle,
        );
        let side = self.input_size as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
        });
        Ok(input.into_tensor().into())
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<Detection>> {
        let input = self.build_input(pixels, width, height)?;
        let outputs = self
            .model
            .run(tvec!(input))
            .map_err(|e| unavailable("ONNX inference failed", e))?;
        let output = outputs
            .first()
            .ok_or_else(|| InspectError::ModelUnavailable("model produced no outputs".into()))?;
        let view = output
            .to_array_view::<f32>()
            .map_err(|e| unavailable("model output tensor was not f32", e))?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .map_err(|e| unavailable("model output is not rank 3", e))?;

        let scale_x = width as f32 / self.input_size as f32;
        let scale_y = height as f32 / self.input_size as f32;
        let candidates = decode_head(view, self.confidence_threshold, scale_x, scale_y)?;
        Ok(non_max_suppression(candidates, self.iou_threshold))
    }
}

fn decode_head(
    head: tract_ndarray::ArrayView3<f32>,
    confidence_threshold: f32,
    scale_x: f32,
    scale_y: f32,
) -> Result<Vec<Detection>> {
    let (batch, attrs, anchors) = head.dim();
    if batch != 1 || attrs < 5 {
        return Err(InspectError::ModelUnavailable(format!(
            "unexpected detection head shape [{batch}, {attrs}, {anchors}]"
        )));
    }

    let mut out = Vec::new();
    for i in 0..anchors {
        let mut best_class = 0usize;
        let mut best_score = f32::NEG_INFINITY;
        for c in 4..attrs {
            let score = head[[0, c, i]];
            if score > best_score {
                best_score = score;
                best_class = c - 4;
            }
        }
        if best_score < confidence_threshold {
            continue;
        }
        let bbox = BoundingBox::from_center(
            head[[0, 0, i]],
            head[[0, 1, i]],
            head[[0, 2, i]],
            head[[0, 3, i]],
        )
        .scaled(scale_x, scale_y);
        out.push(Detection::new(best_class as u32, best_score, bbox));
    }
    Ok(out)
}

fn unavailable(context: &str, err: impl std::fmt::Display) -> InspectError {
    InspectError::ModelUnavailable(format!("{context}: {err}"))
}
