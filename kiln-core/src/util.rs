use std::io::Cursor;

use anyhow::{Context, Result};
use base64::{prelude::BASE64_STANDARD, Engine};
use candle_core::Tensor;
use image::DynamicImage;

/// Converts a u8 tensor with shape (3, height, width) into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels, got {channels}");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .context("error converting tensor to image buffer")?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

pub fn image_to_png(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .context("failed to encode PNG")?;
    Ok(bytes)
}

pub fn image_to_base64_png(img: &DynamicImage) -> Result<String> {
    Ok(BASE64_STANDARD.encode(image_to_png(img)?))
}

/// Decodes a base64 image payload. A `data:` URI prefix is tolerated.
pub fn decode_base64_image(encoded: &str) -> Result<DynamicImage> {
    let payload = match encoded.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => encoded,
    };
    let bytes = BASE64_STANDARD
        .decode(payload.trim())
        .context("reference image is not valid base64")?;
    let img = image::load_from_memory(&bytes).context("reference image could not be decoded")?;
    Ok(DynamicImage::ImageRgb8(img.to_rgb8()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn checker() -> DynamicImage {
        DynamicImage::ImageRgb8(image::RgbImage::from_fn(4, 2, |x, y| {
            image::Rgb([(x * 60) as u8, (y * 120) as u8, 7])
        }))
    }

    #[test]
    fn base64_png_decodes_back_to_rgb() {
        let encoded = image_to_base64_png(&checker()).unwrap();
        let decoded = decode_base64_image(&encoded).unwrap();
        assert_eq!(decoded.to_rgb8(), checker().to_rgb8());

        let data_uri = format!("data:image/png;base64,{encoded}");
        assert_eq!(decode_base64_image(&data_uri).unwrap().to_rgb8(), checker().to_rgb8());
    }

    #[test]
    fn decode_rejects_non_images() {
        assert!(decode_base64_image("not base64!").is_err());
        let text = BASE64_STANDARD.encode(b"plain text");
        assert!(decode_base64_image(&text).is_err());
    }

    #[test]
    fn tensor_to_image_is_channel_first() {
        // Red channel all 255, others 0.
        let mut data = vec![255u8; 6];
        data.extend(vec![0u8; 12]);
        let tensor = Tensor::from_vec(data, (3, 2, 3), &Device::Cpu).unwrap();
        let img = tensor_to_image(&tensor).unwrap().to_rgb8();
        assert_eq!((img.width(), img.height()), (3, 2));
        assert!(img.pixels().all(|p| p.0 == [255, 0, 0]));

        let gray = Tensor::zeros((1, 2, 2), candle_core::DType::U8, &Device::Cpu).unwrap();
        assert!(tensor_to_image(&gray).is_err());
    }
}
