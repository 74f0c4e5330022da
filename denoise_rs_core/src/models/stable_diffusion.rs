use std::path::Path;

use candle_nn::Module;
use candle_transformers::models::stable_diffusion::{
    self, clip::ClipTextTransformer, unet_2d::UNet2DConditionModel, vae::AutoEncoderKL,
    vae::DiagonalGaussianDistribution, StableDiffusionConfig,
};
use denoise_rs_common::{
    core::{DType, Device, Error, Result, Tensor},
    Generator,
};
use tokenizers::Tokenizer;
use tracing::warn;

use super::{Conditioning, DenoisingModel, LatentDistribution, TextEncoder, Vae};

/// Stable Diffusion releases whose UNet, VAE and CLIP layouts are known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StableDiffusionVersion {
    #[value(name = "v1-5")]
    V1_5,
    #[value(name = "v2-1")]
    V2_1,
}

impl StableDiffusionVersion {
    /// Identify the release from the UNet `cross_attention_dim`.
    pub fn from_cross_attention_dim(dim: usize) -> anyhow::Result<Self> {
        match dim {
            768 => Ok(Self::V1_5),
            1024 => Ok(Self::V2_1),
            other => anyhow::bail!("unsupported UNet cross attention dim {other}"),
        }
    }

    pub fn config(&self) -> StableDiffusionConfig {
        match self {
            Self::V1_5 => StableDiffusionConfig::v1_5(None, None, None),
            Self::V2_1 => StableDiffusionConfig::v2_1(None, None, None),
        }
    }

    /// Hub repository holding a `tokenizer.json` compatible with this release's CLIP.
    pub fn tokenizer_repo(&self) -> &'static str {
        "openai/clip-vit-base-patch32"
    }
}

pub struct SdUnet {
    unet: UNet2DConditionModel,
    in_channels: usize,
    sample_size: usize,
    dtype: DType,
    device: Device,
}

impl SdUnet {
    pub fn load(
        config: &StableDiffusionConfig,
        weights: &Path,
        in_channels: usize,
        sample_size: usize,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let unet = config.build_unet(weights, device, in_channels, false, dtype)?;
        Ok(Self {
            unet,
            in_channels,
            sample_size,
            dtype,
            device: device.clone(),
        })
    }
}

impl DenoisingModel for SdUnet {
    fn predict(&self, sample: &Tensor, timestep: f64, conditioning: &Conditioning) -> Result<Tensor> {
        let encoder_hidden_states = conditioning
            .encoder_hidden_states
            .as_ref()
            .ok_or_else(|| Error::Msg("the UNet requires prompt embeddings".to_string()))?;
        self.unet.forward(sample, timestep, encoder_hidden_states)
    }

    fn in_channels(&self) -> usize {
        self.in_channels
    }

    fn sample_size(&self) -> usize {
        self.sample_size
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

// The candle distribution samples from the device RNG, so the generator is not consulted here.
impl LatentDistribution for DiagonalGaussianDistribution {
    fn sample(&self, _generator: &mut Generator) -> Result<Tensor> {
        DiagonalGaussianDistribution::sample(self)
    }
}

pub struct SdVae {
    vae: AutoEncoderKL,
    scaling_factor: f64,
}

impl SdVae {
    pub fn load(
        config: &StableDiffusionConfig,
        weights: &Path,
        scaling_factor: f64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        Ok(Self {
            vae: config.build_vae(weights, device, dtype)?,
            scaling_factor,
        })
    }
}

impl Vae for SdVae {
    fn encode(&self, images: &Tensor) -> Result<Box<dyn LatentDistribution>> {
        Ok(Box::new(self.vae.encode(images)?))
    }

    fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        self.vae.decode(latents)
    }

    fn scaling_factor(&self) -> f64 {
        self.scaling_factor
    }
}

/// CLIP text encoder. Prompts are padded to the model's maximum length, longer prompts are
/// truncated with a warning.
pub struct ClipPromptEncoder {
    tokenizer: Tokenizer,
    model: ClipTextTransformer,
    max_len: usize,
    pad_id: u32,
    dtype: DType,
    device: Device,
}

impl ClipPromptEncoder {
    pub fn load(
        config: &StableDiffusionConfig,
        tokenizer: Tokenizer,
        weights: &Path,
        device: &Device,
        dtype: DType,
    ) -> anyhow::Result<Self> {
        let pad_token = config.clip.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = match tokenizer.get_vocab(true).get(pad_token) {
            Some(id) => *id,
            None => anyhow::bail!("padding token `{pad_token}` is not in the tokenizer vocabulary"),
        };
        let model = stable_diffusion::build_clip_transformer(&config.clip, weights, device, DType::F32)?;
        Ok(Self {
            tokenizer,
            model,
            max_len: config.clip.max_position_embeddings,
            pad_id,
            dtype,
            device: device.clone(),
        })
    }

    fn tokenize(&self, prompt: &str) -> Result<Vec<u32>> {
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| Error::Msg(e.to_string()))?
            .get_ids()
            .to_vec();
        if tokens.len() > self.max_len {
            let removed = self
                .tokenizer
                .decode(&tokens[self.max_len..], true)
                .map_err(|e| Error::Msg(e.to_string()))?;
            warn!(
                "The following part of your input was truncated because CLIP can only handle sequences up to {} tokens: {removed}",
                self.max_len
            );
            tokens.truncate(self.max_len);
        }
        tokens.resize(self.max_len, self.pad_id);
        Ok(tokens)
    }
}

impl TextEncoder for ClipPromptEncoder {
    fn encode(&self, prompts: &[String]) -> Result<Tensor> {
        let tokens = prompts
            .iter()
            .map(|prompt| self.tokenize(prompt))
            .collect::<Result<Vec<_>>>()?
            .concat();
        let tokens = Tensor::from_vec(tokens, (prompts.len(), self.max_len), &self.device)?;
        self.model.forward(&tokens)?.to_dtype(self.dtype)
    }
}
