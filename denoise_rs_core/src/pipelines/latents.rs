use denoise_rs_common::{
    core::{DType, Device, Tensor},
    Generators,
};
use tracing::warn;

use super::PipelineError;
use crate::{models::Vae, schedulers::Scheduler};

/// Encode (or take as-is) the source image, replicate it to `batch_size` and noise it to
/// `latent_timestep`. No noise is added when there is no timestep to start from.
#[allow(clippy::too_many_arguments)]
pub(crate) fn prepare_img2img_latents(
    image: &Tensor,
    vae: &dyn Vae,
    scheduler: &dyn Scheduler,
    latent_timestep: Option<f64>,
    batch_size: usize,
    dtype: DType,
    device: &Device,
    generator: &mut Generators,
) -> anyhow::Result<Tensor> {
    generator.check_batch(batch_size)?;
    let images = image.dim(0)?;
    // Images are only ever replicated, never dropped.
    if images == 0 || images > batch_size || batch_size % images != 0 {
        return Err(PipelineError::ImageBatch { images, batch_size }.into());
    }

    let image = image.to_device(device)?.to_dtype(dtype)?;
    let mut init_latents = if image.dim(1)? == 4 {
        image
    } else {
        let latents = match generator {
            Generators::PerSample(_) => {
                let mut rows = Vec::with_capacity(images);
                for i in 0..images {
                    let dist = vae.encode(&image.narrow(0, i, 1)?)?;
                    rows.push(dist.sample(generator.for_sample(i)?)?);
                }
                Tensor::cat(&rows, 0)?
            }
            Generators::Single(gen) => vae.encode(&image)?.sample(gen)?,
        };
        (latents * vae.scaling_factor())?
    };

    if batch_size > images {
        warn!(
            "You have passed {batch_size} text prompts (`prompt`), but only {images} initial images (`image`). Initial images are now duplicating to match the number of text prompts. Note that this behavior is deprecated and will be removed in a version 1.0.0. Please make sure to update your script to pass as many initial images as text prompts to suppress this warning."
        );
        let copies = vec![&init_latents; batch_size / images];
        init_latents = Tensor::cat(&copies, 0)?;
    }

    match latent_timestep {
        Some(t) => {
            let noise = generator.randn(init_latents.shape(), dtype, device)?;
            Ok(scheduler.add_noise(&init_latents, &noise, t)?)
        }
        None => Ok(init_latents),
    }
}

/// Fresh noise of `shape`, or the supplied latents cast to `dtype`, scaled by the scheduler's
/// initial sigma.
pub(crate) fn prepare_consistency_latents(
    shape: (usize, usize, usize, usize),
    dtype: DType,
    device: &Device,
    generator: &mut Generators,
    latents: Option<&Tensor>,
    init_noise_sigma: f64,
) -> anyhow::Result<Tensor> {
    generator.check_batch(shape.0)?;
    let latents = match latents {
        Some(latents) => latents.to_device(device)?.to_dtype(dtype)?,
        None => generator.randn(shape, dtype, device)?,
    };
    Ok((latents * init_noise_sigma)?)
}
