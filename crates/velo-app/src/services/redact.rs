use std::io::Cursor;

use image::{DynamicImage, ImageFormat, Rgb, RgbImage, imageops};

use crate::constants::BOX_MARGIN;
use crate::services::detector::Face;

// Pure redaction rendering.
//
// Everything here is deterministic and side-effect free: same image, same
// faces, same config produce byte-identical output. The caller's image is
// never mutated. Cover resizing uses bilinear interpolation
// (`FilterType::Triangle`).

/// How detected regions are covered.
#[derive(Debug, Clone)]
pub enum RedactionConfig {
    /// Fill the box with a solid opaque color.
    Rectangle(Rgb<u8>),
    /// Resize the cover image to the box and composite it. A cover with an
    /// alpha channel is blended per pixel; one without overwrites the region.
    ImageOverlay(DynamicImage),
}

impl RedactionConfig {
    /// The default: opaque black rectangles.
    pub fn black() -> Self {
        RedactionConfig::Rectangle(Rgb([0, 0, 0]))
    }
}

/// Renderer output: the new image buffer plus the detections that survived
/// confidence gating, in input order. `faces.len()` is the redacted count;
/// the confidence-score report is derived from it, so the two always agree.
#[derive(Debug)]
pub struct Redacted {
    pub image: RgbImage,
    pub faces: Vec<Face>,
}

/// Cover every gated face in `image` according to `config`.
///
/// Per face: detections below `min_confidence` are discarded; the box is
/// enlarged by [`BOX_MARGIN`] on width and height (detected boxes tend to cut
/// off hairline and ears), the top-left corner is clamped to be non-negative
/// (detectors return small negative coordinates at image edges), and the box
/// is clipped to image bounds before painting. A gated face whose box clips
/// to nothing is counted but paints nothing.
pub fn redact_faces(
    image: &RgbImage,
    faces: &[Face],
    config: &RedactionConfig,
    min_confidence: f64,
) -> Redacted {
    let mut out = image.clone();
    let mut gated = Vec::new();

    for face in faces {
        if face.confidence < min_confidence {
            continue;
        }
        gated.push(face.clone());

        let width = (f64::from(face.width) * BOX_MARGIN) as u32;
        let height = (f64::from(face.height) * BOX_MARGIN) as u32;
        let x = face.x.max(0) as u32;
        let y = face.y.max(0) as u32;

        let x_end = x.saturating_add(width).min(out.width());
        let y_end = y.saturating_add(height).min(out.height());
        if x >= x_end || y >= y_end {
            continue;
        }

        match config {
            RedactionConfig::Rectangle(color) => {
                for py in y..y_end {
                    for px in x..x_end {
                        out.put_pixel(px, py, *color);
                    }
                }
            }
            RedactionConfig::ImageOverlay(cover) => {
                paint_overlay(&mut out, cover, x, y, width, height, x_end, y_end);
            }
        }
    }

    Redacted { image: out, faces: gated }
}

#[allow(clippy::too_many_arguments)]
fn paint_overlay(
    out: &mut RgbImage,
    cover: &DynamicImage,
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    x_end: u32,
    y_end: u32,
) {
    debug_assert!(width > 0 && height > 0);

    if cover.color().has_alpha() {
        let resized = imageops::resize(&cover.to_rgba8(), width, height, imageops::FilterType::Triangle);
        for py in y..y_end {
            for px in x..x_end {
                let src = resized.get_pixel(px - x, py - y);
                let alpha = f64::from(src[3]) / 255.0;
                let base = *out.get_pixel(px, py);
                let blended = Rgb([
                    blend_channel(base[0], src[0], alpha),
                    blend_channel(base[1], src[1], alpha),
                    blend_channel(base[2], src[2], alpha),
                ]);
                out.put_pixel(px, py, blended);
            }
        }
    } else {
        let resized = imageops::resize(&cover.to_rgb8(), width, height, imageops::FilterType::Triangle);
        for py in y..y_end {
            for px in x..x_end {
                out.put_pixel(px, py, *resized.get_pixel(px - x, py - y));
            }
        }
    }
}

fn blend_channel(base: u8, overlay: u8, alpha: f64) -> u8 {
    (f64::from(base) * (1.0 - alpha) + f64::from(overlay) * alpha) as u8
}

/// Decode arbitrary uploaded bytes into an image.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, image::ImageError> {
    image::load_from_memory(bytes)
}

/// Output encoding implied by the original filename's extension:
/// `.jpg`/`.jpeg` stay JPEG, everything else becomes PNG.
pub fn output_format_for(filename: &str) -> ImageFormat {
    let lower = filename.to_ascii_lowercase();
    if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        ImageFormat::Jpeg
    } else {
        ImageFormat::Png
    }
}

/// Encode a rendered image in the format implied by `filename`.
pub fn encode_image(image: &RgbImage, filename: &str) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, output_format_for(filename))?;
    Ok(buf.into_inner())
}

/// Derive the stored output name: `group.jpg` becomes `group_redacted.jpg`.
pub fn output_filename(filename: &str) -> String {
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}_redacted.{ext}"),
        _ => format!("{filename}_redacted"),
    }
}

/// MIME type for serving a stored blob, derived from its filename extension.
pub fn mime_for_filename(filename: &str) -> &'static str {
    match output_format_for(filename) {
        ImageFormat::Jpeg => "image/jpeg",
        _ => "image/png",
    }
}
