use std::path::Path;

use image::RgbImage;
use thiserror::Error;

/// Bounding box of a detected face within an image.
///
/// Coordinates are pixels in the source image. Detectors may return slightly
/// negative corners at image edges; the renderer clamps them.
#[derive(Debug, Clone, PartialEq)]
pub struct Face {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    /// Detection confidence in `[0, 1]`.
    pub confidence: f64,
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct DetectError {
    message: String,
}

impl DetectError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Pluggable face detection backend.
///
/// Synchronous and possibly slow (hundreds of milliseconds); callers run it
/// under `spawn_blocking`. Implementations never mutate the input image and
/// never retry internally: an error fails the whole job at the caller.
pub trait FaceDetector: Send + Sync {
    fn detect(&self, image: &RgbImage) -> Result<Vec<Face>, DetectError>;
}

/// SeetaFace raw scores are unbounded positives; divide by this scale and
/// clamp to map them into the `[0, 1]` range the gating threshold expects.
const SEETA_SCORE_SCALE: f64 = 30.0;

/// Face detector backed by the `rustface` crate (SeetaFace engine).
///
/// Loads the frontal model from a configured path on construction.
pub struct RustfaceDetector {
    model: rustface::Model,
}

impl RustfaceDetector {
    pub fn from_model_path(path: &Path) -> Result<Self, DetectError> {
        let file = std::fs::File::open(path).map_err(|e| {
            DetectError::new(format!("failed to open SeetaFace model {}: {e}", path.display()))
        })?;
        let model = rustface::read_model(std::io::BufReader::new(file))
            .map_err(|e| DetectError::new(format!("failed to load SeetaFace model: {e}")))?;
        Ok(Self { model })
    }
}

impl FaceDetector for RustfaceDetector {
    fn detect(&self, image: &RgbImage) -> Result<Vec<Face>, DetectError> {
        let gray = image::imageops::grayscale(image);
        let (width, height) = gray.dimensions();

        let mut detector = rustface::create_detector_with_model(self.model.clone());
        detector.set_min_face_size(20);
        detector.set_score_thresh(2.0);
        detector.set_pyramid_scale_factor(0.8);
        detector.set_slide_window_step(4, 4);

        let faces = detector.detect(&rustface::ImageData::new(gray.as_raw(), width, height));

        Ok(faces
            .iter()
            .map(|face| {
                let bbox = face.bbox();
                Face {
                    x: bbox.x(),
                    y: bbox.y(),
                    width: bbox.width(),
                    height: bbox.height(),
                    confidence: (face.score() / SEETA_SCORE_SCALE).clamp(0.0, 1.0),
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedDetector(Vec<Face>);

    impl FaceDetector for FixedDetector {
        fn detect(&self, _image: &RgbImage) -> Result<Vec<Face>, DetectError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn trait_object_detects_without_mutating_input() {
        let image = RgbImage::from_pixel(8, 8, image::Rgb([7, 7, 7]));
        let before = image.clone();
        let detector: Box<dyn FaceDetector> = Box::new(FixedDetector(vec![Face {
            x: -2,
            y: 1,
            width: 4,
            height: 4,
            confidence: 0.95,
        }]));

        let faces = detector.detect(&image).expect("detect");

        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].x, -2);
        assert_eq!(image, before);
    }

    #[test]
    fn detect_error_preserves_message_verbatim() {
        let err = DetectError::new("model unavailable");
        assert_eq!(err.to_string(), "model unavailable");
    }
}
