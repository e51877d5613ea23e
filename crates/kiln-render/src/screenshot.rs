//! Saving rendered attachments to image files.

use std::path::Path;

use ash::vk;
use image::{ImageBuffer, Rgba};
use kiln_core::Extent;
use kiln_gpu::{Framebuffer, GpuContext, GpuError};
use thiserror::Error;
use tracing::info;

/// Errors that can occur while capturing an attachment.
#[derive(Error, Debug)]
pub enum ScreenshotError {
    #[error("failed to read attachment: {0}")]
    Readback(#[from] GpuError),
    #[error("framebuffer '{name}' has no offscreen colour attachment {index}")]
    NoAttachment { name: String, index: usize },
    #[error("unsupported attachment format {0:?}")]
    UnsupportedFormat(vk::Format),
    #[error("pixel data does not match {0}")]
    InvalidImageData(Extent),
    #[error("failed to save image: {0}")]
    Save(#[from] image::ImageError),
}

/// Convert tightly packed texels of `format` to RGBA8.
pub fn to_rgba8(format: vk::Format, mut data: Vec<u8>) -> Result<Vec<u8>, ScreenshotError> {
    match format {
        vk::Format::R8G8B8A8_UNORM | vk::Format::R8G8B8A8_SRGB => Ok(data),
        vk::Format::B8G8R8A8_UNORM | vk::Format::B8G8R8A8_SRGB => {
            for texel in data.chunks_exact_mut(4) {
                texel.swap(0, 2);
            }
            Ok(data)
        }
        other => Err(ScreenshotError::UnsupportedFormat(other)),
    }
}

/// Save RGBA8 pixels; the format follows the file extension.
pub fn save_rgba(
    data: Vec<u8>,
    extent: Extent,
    path: impl AsRef<Path>,
) -> Result<(), ScreenshotError> {
    let path = path.as_ref();
    let image = ImageBuffer::<Rgba<u8>, _>::from_raw(extent.width, extent.height, data)
        .ok_or(ScreenshotError::InvalidImageData(extent))?;
    image.save(path)?;
    info!("Screenshot saved: {}", path.display());
    Ok(())
}

/// Read colour attachment `index` of an offscreen framebuffer and save it.
///
/// The attachment must be in `SHADER_READ_ONLY_OPTIMAL`, as left by an
/// offscreen pass, and no submitted work may still write it.
pub fn capture_attachment(
    gpu: &GpuContext,
    framebuffer: &Framebuffer,
    index: usize,
    path: impl AsRef<Path>,
) -> Result<(), ScreenshotError> {
    let image = framebuffer
        .color_attachment(index)
        .ok_or_else(|| ScreenshotError::NoAttachment {
            name: framebuffer.name().to_owned(),
            index,
        })?;
    let data = image.read_back(gpu, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)?;
    let rgba = to_rgba8(image.format(), data)?;
    save_rgba(rgba, image.extent(), path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bgra_is_swizzled() {
        let rgba = to_rgba8(vk::Format::B8G8R8A8_UNORM, vec![1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert_eq!(rgba, [3, 2, 1, 4, 7, 6, 5, 8]);
        assert!(matches!(
            to_rgba8(vk::Format::R16G16B16A16_SFLOAT, Vec::new()),
            Err(ScreenshotError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn mismatched_data_is_rejected() {
        let path = std::env::temp_dir().join("kiln-screenshot-invalid.png");
        let err = save_rgba(vec![0; 7], Extent::new(2, 2), &path).unwrap_err();
        assert!(matches!(err, ScreenshotError::InvalidImageData(_)));
    }

    #[test]
    fn saves_png() {
        let path = std::env::temp_dir().join("kiln-screenshot-test.png");
        save_rgba(vec![255; 16], Extent::new(2, 2), &path).unwrap();
        let loaded = image::open(&path).unwrap().to_rgba8();
        assert_eq!(loaded.dimensions(), (2, 2));
        let _ = std::fs::remove_file(path);
    }
}
