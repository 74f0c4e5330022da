mod stable_diffusion;

use denoise_rs_common::{
    core::{DType, Device, Result, Tensor},
    Generator,
};

pub use stable_diffusion::{ClipPromptEncoder, SdUnet, SdVae, StableDiffusionVersion};

/// Conditioning handed to the denoising model at every step.
#[derive(Debug, Clone, Default)]
pub struct Conditioning {
    /// Prompt embeddings, `(batch, seq, dim)`. Doubled in batch when guidance is active.
    pub encoder_hidden_states: Option<Tensor>,
    /// Integer class labels, `(batch,)`, for class-conditional models.
    pub class_labels: Option<Tensor>,
}

/// A network predicting the noise residual (or the denoised sample, depending on the scheduler)
/// for a latent at a given timestep.
pub trait DenoisingModel: Send + Sync {
    fn predict(&self, sample: &Tensor, timestep: f64, conditioning: &Conditioning) -> Result<Tensor>;

    fn in_channels(&self) -> usize;

    /// Spatial size of the samples the model was trained on.
    fn sample_size(&self) -> usize;

    /// Number of class embeddings for class-conditional models.
    fn num_class_embeds(&self) -> Option<usize> {
        None
    }

    fn dtype(&self) -> DType;

    fn device(&self) -> &Device;
}

/// A distribution over latents returned by [`Vae::encode`].
pub trait LatentDistribution {
    fn sample(&self, generator: &mut Generator) -> Result<Tensor>;
}

/// Diagonal gaussian parameterized by mean and standard deviation.
#[derive(Debug, Clone)]
pub struct DiagonalGaussian {
    mean: Tensor,
    std: Tensor,
}

impl DiagonalGaussian {
    pub fn new(mean: Tensor, std: Tensor) -> Self {
        Self { mean, std }
    }

    /// Split encoder moments `(b, 2c, h, w)` into mean and log variance along the channels.
    pub fn from_moments(moments: &Tensor) -> Result<Self> {
        let channels = moments.dim(1)?;
        if channels % 2 != 0 {
            denoise_rs_common::core::bail!("expected an even number of moment channels, got {channels}");
        }
        let mean = moments.narrow(1, 0, channels / 2)?;
        let logvar = moments.narrow(1, channels / 2, channels / 2)?.clamp(-30f32, 20f32)?;
        let std = (logvar * 0.5)?.exp()?;
        Ok(Self { mean, std })
    }

    pub fn mean(&self) -> &Tensor {
        &self.mean
    }
}

impl LatentDistribution for DiagonalGaussian {
    fn sample(&self, generator: &mut Generator) -> Result<Tensor> {
        let noise = generator.randn(self.mean.shape(), self.mean.dtype(), self.mean.device())?;
        &self.mean + (&self.std * noise)?
    }
}

pub trait Vae: Send + Sync {
    /// Encode images in `[-1, 1]` into a latent distribution. This *does not* apply the scaling factor.
    fn encode(&self, images: &Tensor) -> Result<Box<dyn LatentDistribution>>;

    /// Decode latents into images in `[-1, 1]`. Callers divide by [`Vae::scaling_factor`] first.
    fn decode(&self, latents: &Tensor) -> Result<Tensor>;

    fn scaling_factor(&self) -> f64;
}

/// Turns prompts into embeddings of shape `(prompts.len(), seq, dim)`.
pub trait TextEncoder: Send + Sync {
    fn encode(&self, prompts: &[String]) -> Result<Tensor>;
}

/// Classifies decoded images, which are still in `[-1, 1]`.
pub trait SafetyChecker: Send + Sync {
    /// Returns the possibly modified images and one unsafe flag per image.
    fn check(&self, images: &Tensor) -> Result<(Tensor, Vec<bool>)>;
}
