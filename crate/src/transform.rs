//! Pixel work behind resize and crop presets.
//!
//! The coordinators only need [`ImageTransformer`]; [`RustTransformer`] is the
//! default implementation on top of the `image` crate.

use std::path::PathBuf;

use image::imageops::FilterType;
use image::metadata::Orientation;
use image::{DynamicImage, ImageDecoder, ImageFormat, ImageReader};
use thiserror::Error;

use crate::plan::{Dimensions, Transform};

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("nothing to transform for an original preset")]
    NoTransform,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformRequest {
    pub source: PathBuf,
    pub output: PathBuf,
    pub transform: Transform,
}

/// Produces a derived image file. Runs on a blocking thread.
pub trait ImageTransformer: Send + Sync {
    fn transform(&self, request: &TransformRequest) -> Result<(), TransformError>;
}

/// Auto-orients, then resizes to fit and/or center-crops with the `image` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct RustTransformer;

impl RustTransformer {
    pub fn new() -> Self {
        Self
    }
}

fn load_oriented(request: &TransformRequest) -> Result<DynamicImage, TransformError> {
    let mut decoder = ImageReader::open(&request.source)?
        .with_guessed_format()?
        .into_decoder()?;
    let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);
    let mut image = DynamicImage::from_decoder(decoder)?;
    image.apply_orientation(orientation);
    Ok(image)
}

fn resize_to_fit(image: &DynamicImage, target: Dimensions) -> DynamicImage {
    image.resize(target.width, target.height, FilterType::Lanczos3)
}

/// Crop around the image center, clamped to the image bounds.
fn center_crop(image: &DynamicImage, target: Dimensions) -> DynamicImage {
    let width = target.width.min(image.width());
    let height = target.height.min(image.height());
    let x = (image.width() - width) / 2;
    let y = (image.height() - height) / 2;
    image.crop_imm(x, y, width, height)
}

impl ImageTransformer for RustTransformer {
    fn transform(&self, request: &TransformRequest) -> Result<(), TransformError> {
        if request.transform == Transform::None {
            return Err(TransformError::NoTransform);
        }
        let image = load_oriented(request)?;
        let derived = match request.transform {
            Transform::None => image,
            Transform::Resize(size) => resize_to_fit(&image, size),
            Transform::Crop(size) => center_crop(&image, size),
            Transform::ResizeAndCrop { resize, crop } => center_crop(&resize_to_fit(&image, resize), crop),
        };
        let format = ImageFormat::from_path(&request.output)?;
        let derived = match format {
            ImageFormat::Jpeg => DynamicImage::ImageRgb8(derived.to_rgb8()),
            _ => derived,
        };
        derived.save_with_format(&request.output, format)?;
        Ok(())
    }
}
