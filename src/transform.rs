//! The decode → resize → encode pipeline behind derivative builds.

pub mod params;

use crate::cache;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ExtendedColorType, GenericImageView, ImageEncoder};
use params::{ImageParams, ResizePlan};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Build failures are cloned out to every coalesced waiter, so the
/// variants carry owned strings rather than source errors.
#[derive(Debug, Clone, Error)]
pub enum ConvertError {
    #[error("image not found")]
    NotFound,
    #[error("corrupt image: {0}")]
    Corrupt(String),
    #[error("{0}")]
    Io(String),
    #[error("{0}")]
    Internal(String),
}

/// The injectable transform capability: `(input, output, params)`.
/// Production code points this at [`convert`]; tests substitute a
/// counting wrapper.
pub type TransformFn =
    Arc<dyn Fn(&Path, &Path, &ImageParams) -> Result<(), ConvertError> + Send + Sync>;

/// Reads the original at `input`, produces the derivative described by
/// `params` and writes it atomically to `output`. On success the output
/// file exists as a complete file.
///
/// GIF originals are passed through unchanged; everything else is
/// re-encoded as WebP or JPEG depending on the negotiated output.
pub fn convert(input: &Path, output: &Path, params: &ImageParams) -> Result<(), ConvertError> {
    let buffer = match std::fs::read(input) {
        Ok(buffer) => buffer,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConvertError::NotFound)
        }
        Err(err) => return Err(ConvertError::Io(err.to_string())),
    };

    let format = image::guess_format(&buffer).map_err(|err| ConvertError::Corrupt(err.to_string()))?;
    if format == image::ImageFormat::Gif {
        return cache::store(output, &buffer).map_err(|err| ConvertError::Io(err.to_string()));
    }

    let img = image::load_from_memory_with_format(&buffer, format)
        .map_err(|err| ConvertError::Corrupt(err.to_string()))?;
    let (orig_width, orig_height) = img.dimensions();
    let resized = apply_plan(img, params.resize_plan(orig_width, orig_height));

    let quality = params.quality.clamp(1, 100) as u8;
    let encoded = if params.webp_accepted {
        encode_webp(&resized, quality)
    } else {
        encode_jpeg(&resized, quality)?
    };

    cache::store(output, &encoded).map_err(|err| ConvertError::Io(err.to_string()))
}

fn apply_plan(img: DynamicImage, plan: ResizePlan) -> DynamicImage {
    if plan.crop && plan.width > 0 && plan.height > 0 {
        return img.resize_to_fill(plan.width, plan.height, image::imageops::FilterType::Lanczos3);
    }

    let (orig_width, orig_height) = img.dimensions();
    // A zero axis is derived from the constrained one.
    let (target_width, target_height) = match (plan.width, plan.height) {
        (0, 0) => return img,
        (width, 0) => {
            let ratio = width as f32 / orig_width as f32;
            (width, (orig_height as f32 * ratio).round() as u32)
        }
        (0, height) => {
            let ratio = height as f32 / orig_height as f32;
            ((orig_width as f32 * ratio).round() as u32, height)
        }
        (width, height) => (width, height),
    };
    img.resize(
        target_width.max(1),
        target_height.max(1),
        image::imageops::FilterType::Lanczos3,
    )
}

fn encode_webp(img: &DynamicImage, quality: u8) -> Vec<u8> {
    let rgb = img.to_rgb8();
    let (width, height) = rgb.dimensions();
    let encoder = webp::Encoder::from_rgb(rgb.as_raw(), width, height);
    encoder.encode(quality as f32).to_vec()
}

fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, ConvertError> {
    let rgb = img.to_rgb8();
    let (width, height) = rgb.dimensions();
    let mut out = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut out, quality);
    encoder
        .write_image(rgb.as_raw(), width, height, ExtendedColorType::Rgb8)
        .map_err(|err| ConvertError::Internal(err.to_string()))?;
    Ok(out)
}
