use denoise_rs_common::core::{DType, Device, Result, Tensor};
use image::{imageops::FilterType, DynamicImage, RgbImage};

use super::{ImageArray, OutputType, PipelineError, PipelineImages};

/// Latent downsampling factor of the VAE. Image sides are cropped to a multiple of it.
const VAE_SCALE_FACTOR: u32 = 8;

/// Convert an image to a `(1, 3, h, w)` tensor in `[-1, 1]`, resized down so both sides are
/// multiples of 8.
pub fn preprocess(image: &DynamicImage, device: &Device) -> Result<Tensor> {
    let width = image.width() - image.width() % VAE_SCALE_FACTOR;
    let height = image.height() - image.height() % VAE_SCALE_FACTOR;
    if width == 0 || height == 0 {
        denoise_rs_common::core::bail!(
            "image of {}x{} is smaller than the VAE scale factor",
            image.width(),
            image.height()
        );
    }
    let image = image
        .resize_to_fill(width, height, FilterType::CatmullRom)
        .to_rgb8()
        .into_raw();
    Tensor::from_vec(image, (height as usize, width as usize, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(2. / 255., -1.)?
        .unsqueeze(0)
}

/// Map `[-1, 1]` to `[0, 1]`.
pub fn denormalize(images: &Tensor) -> Result<Tensor> {
    ((images / 2.)? + 0.5)?.clamp(0f32, 1f32)
}

/// Denormalize a decoded batch and convert it to `output_type`. Rows flagged by the safety
/// checker are zeroed instead of being denormalized.
pub fn postprocess(
    images: &Tensor,
    output_type: OutputType,
    nsfw_flags: Option<&[bool]>,
) -> anyhow::Result<PipelineImages> {
    let images = match nsfw_flags {
        Some(flags) if flags.iter().any(|f| *f) => {
            let batch = images.dim(0)?;
            if flags.len() != batch {
                anyhow::bail!("got {} safety flags for a batch of {batch}", flags.len());
            }
            let rows = flags
                .iter()
                .enumerate()
                .map(|(i, flagged)| {
                    let row = images.narrow(0, i, 1)?;
                    if *flagged {
                        row.zeros_like()
                    } else {
                        denormalize(&row)
                    }
                })
                .collect::<Result<Vec<_>>>()?;
            Tensor::cat(&rows, 0)?
        }
        _ => denormalize(images)?,
    };

    match output_type {
        OutputType::Tensor => Ok(PipelineImages::Tensor(images)),
        OutputType::Array => Ok(PipelineImages::Array(to_array(&images)?)),
        OutputType::Image => Ok(PipelineImages::Images(to_images(&images)?)),
        OutputType::Latent => Err(PipelineError::UnsupportedOutputType(output_type).into()),
    }
}

fn to_array(images: &Tensor) -> Result<ImageArray> {
    let images = images.permute((0, 2, 3, 1))?;
    let shape = images.dims4()?;
    let data = images
        .to_device(&Device::Cpu)?
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    Ok(ImageArray { shape, data })
}

fn to_images(images: &Tensor) -> anyhow::Result<Vec<DynamicImage>> {
    let (b, c, h, w) = images.dims4()?;
    if c != 3 {
        anyhow::bail!("Expected 3 channels in image output, got {c}");
    }
    let pixels = (images.to_device(&Device::Cpu)?.to_dtype(DType::F32)? * 255.)?
        .round()?
        .to_dtype(DType::U8)?;
    let mut out = Vec::with_capacity(b);
    for i in 0..b {
        let flattened = pixels.get(i)?.permute((1, 2, 0))?.flatten_all()?;
        #[allow(clippy::cast_possible_truncation)]
        out.push(DynamicImage::ImageRgb8(
            RgbImage::from_raw(w as u32, h as u32, flattened.to_vec1::<u8>()?).ok_or(
                denoise_rs_common::core::Error::Msg("RgbImage has invalid capacity.".to_string()),
            )?,
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denormalize_clamps() -> Result<()> {
        let x = Tensor::new(&[-3f32, -1., 0., 1., 3.], &Device::Cpu)?;
        assert_eq!(denormalize(&x)?.to_vec1::<f32>()?, vec![0., 0., 0.5, 1., 1.]);
        Ok(())
    }

    #[test]
    fn flagged_images_are_zeroed() -> anyhow::Result<()> {
        let images = Tensor::ones((2, 3, 2, 2), DType::F32, &Device::Cpu)?;
        let PipelineImages::Tensor(out) =
            postprocess(&images, OutputType::Tensor, Some(&[false, true]))?
        else {
            anyhow::bail!("expected a tensor");
        };
        assert_eq!(out.dims(), &[2, 3, 2, 2]);
        let sums = out.sum((1, 2, 3))?.to_vec1::<f32>()?;
        assert_eq!(sums, vec![12., 0.]);
        Ok(())
    }

    #[test]
    fn array_output_is_channels_last() -> anyhow::Result<()> {
        let images = Tensor::zeros((1, 3, 2, 4), DType::F32, &Device::Cpu)?;
        let PipelineImages::Array(array) = postprocess(&images, OutputType::Array, None)? else {
            anyhow::bail!("expected an array");
        };
        assert_eq!(array.shape, (1, 2, 4, 3));
        assert_eq!(array.data, vec![0.5; 24]);
        Ok(())
    }

    #[test]
    fn image_output_converts_pixels() -> anyhow::Result<()> {
        let images = Tensor::ones((2, 3, 2, 2), DType::F32, &Device::Cpu)?;
        let PipelineImages::Images(out) = postprocess(&images, OutputType::Image, None)? else {
            anyhow::bail!("expected images");
        };
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].width(), 2);
        assert!(out[1].to_rgb8().pixels().all(|p| p.0 == [255, 255, 255]));
        Ok(())
    }

    #[test]
    fn preprocess_crops_to_multiples_of_eight() -> Result<()> {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(20, 17, image::Rgb([255, 0, 127])));
        let tensor = preprocess(&image, &Device::Cpu)?;
        assert_eq!(tensor.dims(), &[1, 3, 16, 16]);
        let red = tensor.get(0)?.get(0)?.flatten_all()?.to_vec1::<f32>()?;
        assert!(red.iter().all(|v| (v - 1.).abs() < 1e-6));
        let green = tensor.get(0)?.get(1)?.flatten_all()?.to_vec1::<f32>()?;
        assert!(green.iter().all(|v| (v + 1.).abs() < 1e-6));
        Ok(())
    }
}
