use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use denoise_rs_common::{
    core::{DType, Device, Tensor},
    FileLoader, Generators, ModelSource,
};
use serde::Deserialize;
use tokenizers::Tokenizer;
use tracing::{info, Dispatch};

use super::{
    current_log_sink,
    denoise::DenoiseLoop,
    guidance::do_classifier_free_guidance,
    image_processor::postprocess,
    latents::prepare_img2img_latents,
    strength_schedule,
    validation::{check_img2img_inputs, PipelineError},
    ComponentElem, ComponentName, ImagePipelineOutput, LoadContext, Loader, NoopObserver,
    OutputType, PipelineImages, Prompt, StepObserver,
};
use crate::{
    models::{
        ClipPromptEncoder, Conditioning, DenoisingModel, SafetyChecker, SdUnet, SdVae,
        StableDiffusionVersion, TextEncoder, Vae,
    },
    schedulers::{Scheduler, SchedulerConfig},
};

/// Call parameters of [`Image2ImagePipeline::generate`].
#[derive(Debug, Clone, PartialEq)]
pub struct Img2ImgParams {
    /// How much of the source image is replaced, in `[0, 1]`. `1.0` ignores the image content.
    pub strength: f64,
    pub num_inference_steps: usize,
    /// Classifier-free guidance is enabled when this is above `1.0`.
    pub guidance_scale: f64,
    pub num_images_per_prompt: usize,
    /// Only used by schedulers accepting it (DDIM).
    pub eta: f64,
    pub output_type: OutputType,
    pub callback_steps: usize,
}

impl Default for Img2ImgParams {
    fn default() -> Self {
        Self {
            strength: 0.8,
            num_inference_steps: 50,
            guidance_scale: 7.5,
            num_images_per_prompt: 1,
            eta: 0.0,
            output_type: OutputType::Image,
            callback_steps: 1,
        }
    }
}

/// Conditioning and source image of an image-to-image call. Exactly one of `prompt` and
/// `prompt_embeds` must be set.
#[derive(Debug, Clone)]
pub struct Img2ImgInputs {
    pub prompt: Option<Prompt>,
    pub negative_prompt: Option<Prompt>,
    pub prompt_embeds: Option<Tensor>,
    pub negative_prompt_embeds: Option<Tensor>,
    /// `(b, 3, h, w)` in `[-1, 1]`, or `(b, 4, h, w)` latents used as-is.
    pub image: Tensor,
}

impl Img2ImgInputs {
    pub fn from_prompt(prompt: impl Into<Prompt>, image: Tensor) -> Self {
        Self {
            prompt: Some(prompt.into()),
            negative_prompt: None,
            prompt_embeds: None,
            negative_prompt_embeds: None,
            image,
        }
    }

    pub fn from_embeds(prompt_embeds: Tensor, image: Tensor) -> Self {
        Self {
            prompt: None,
            negative_prompt: None,
            prompt_embeds: Some(prompt_embeds),
            negative_prompt_embeds: None,
            image,
        }
    }

    pub fn with_negative_prompt(mut self, negative_prompt: impl Into<Prompt>) -> Self {
        self.negative_prompt = Some(negative_prompt.into());
        self
    }

    pub fn with_negative_prompt_embeds(mut self, negative_prompt_embeds: Tensor) -> Self {
        self.negative_prompt_embeds = Some(negative_prompt_embeds);
        self
    }

    fn prompt_batch_size(&self) -> Result<usize> {
        match (&self.prompt, &self.prompt_embeds) {
            (Some(prompt), _) => Ok(prompt.len()),
            (None, Some(embeds)) => Ok(embeds.dim(0)?),
            (None, None) => Err(PipelineError::MissingPrompt.into()),
        }
    }
}

/// Text-guided image-to-image generation: the source image is encoded, noised to `strength`,
/// and denoised under the prompt.
pub struct Image2ImagePipeline {
    unet: Arc<dyn DenoisingModel>,
    vae: Arc<dyn Vae>,
    text_encoder: Arc<dyn TextEncoder>,
    scheduler: Box<dyn Scheduler>,
    safety_checker: Option<Arc<dyn SafetyChecker>>,
    log: Dispatch,
    silent: bool,
}

impl Image2ImagePipeline {
    pub fn new(
        unet: Arc<dyn DenoisingModel>,
        vae: Arc<dyn Vae>,
        text_encoder: Arc<dyn TextEncoder>,
        scheduler: Box<dyn Scheduler>,
    ) -> Self {
        Self {
            unet,
            vae,
            text_encoder,
            scheduler,
            safety_checker: None,
            log: current_log_sink(),
            silent: false,
        }
    }

    pub fn with_safety_checker(mut self, safety_checker: Arc<dyn SafetyChecker>) -> Self {
        self.safety_checker = Some(safety_checker);
        self
    }

    /// Route this pipeline's warnings and progress logs to `log` instead of the global
    /// subscriber.
    pub fn with_log_sink(mut self, log: Dispatch) -> Self {
        self.log = log;
        self
    }

    /// Hide the progress bar.
    pub fn with_silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    pub fn scheduler(&self) -> &dyn Scheduler {
        self.scheduler.as_ref()
    }

    pub fn generate(
        &mut self,
        inputs: &Img2ImgInputs,
        params: &Img2ImgParams,
        generator: &mut Generators,
    ) -> Result<ImagePipelineOutput> {
        self.generate_with_observer(inputs, params, generator, &mut NoopObserver)
    }

    pub fn generate_with_observer(
        &mut self,
        inputs: &Img2ImgInputs,
        params: &Img2ImgParams,
        generator: &mut Generators,
        observer: &mut dyn StepObserver,
    ) -> Result<ImagePipelineOutput> {
        let log = self.log.clone();
        tracing::dispatcher::with_default(&log, || self.run(inputs, params, generator, observer))
    }

    fn run(
        &mut self,
        inputs: &Img2ImgInputs,
        params: &Img2ImgParams,
        generator: &mut Generators,
        observer: &mut dyn StepObserver,
    ) -> Result<ImagePipelineOutput> {
        check_img2img_inputs(inputs, params)?;
        let batch_size = inputs.prompt_batch_size()? * params.num_images_per_prompt;
        generator.check_batch(batch_size)?;

        let device = self.unet.device().clone();
        let dtype = self.unet.dtype();
        let do_cfg = do_classifier_free_guidance(params.guidance_scale);
        let prompt_embeds = self.encode_prompt(
            inputs,
            params.num_images_per_prompt,
            do_cfg,
            dtype,
            &device,
        )?;

        self.scheduler.set_timesteps(params.num_inference_steps)?;
        let (timesteps, num_inference_steps) = strength_schedule(
            self.scheduler.timesteps(),
            params.num_inference_steps,
            params.strength,
            self.scheduler.order(),
        );
        info!(
            "running {num_inference_steps} of {} steps for strength {}",
            params.num_inference_steps, params.strength
        );

        let latents = prepare_img2img_latents(
            &inputs.image,
            self.vae.as_ref(),
            self.scheduler.as_ref(),
            timesteps.first().copied(),
            batch_size,
            dtype,
            &device,
            generator,
        )?;

        let conditioning = Conditioning {
            encoder_hidden_states: Some(prompt_embeds),
            class_labels: None,
        };
        let latents = DenoiseLoop {
            model: self.unet.as_ref(),
            conditioning: &conditioning,
            guidance_scale: do_cfg.then_some(params.guidance_scale),
            num_inference_steps,
            eta: params.eta,
            callback_steps: params.callback_steps,
            silent: self.silent,
        }
        .run(
            self.scheduler.as_mut(),
            &timesteps,
            latents,
            generator,
            observer,
        )?;

        if params.output_type == OutputType::Latent {
            return Ok(ImagePipelineOutput {
                images: PipelineImages::Latent(latents),
                nsfw_content_detected: None,
            });
        }

        let images = self
            .vae
            .decode(&(latents / self.vae.scaling_factor())?)?;
        let (images, nsfw_content_detected) = match &self.safety_checker {
            Some(checker) => {
                let (images, flags) = checker.check(&images)?;
                (images, Some(flags))
            }
            None => (images, None),
        };
        let images = postprocess(
            &images,
            params.output_type,
            nsfw_content_detected.as_deref(),
        )?;
        Ok(ImagePipelineOutput {
            images,
            nsfw_content_detected,
        })
    }

    /// Embeddings of shape `(batch * num_images_per_prompt, seq, dim)`, prefixed by the
    /// unconditional embeddings when guidance is enabled.
    fn encode_prompt(
        &self,
        inputs: &Img2ImgInputs,
        num_images_per_prompt: usize,
        do_cfg: bool,
        dtype: DType,
        device: &Device,
    ) -> Result<Tensor> {
        let prompt_embeds = match (&inputs.prompt_embeds, &inputs.prompt) {
            (Some(embeds), _) => embeds.clone(),
            (None, Some(prompt)) => self.text_encoder.encode(&prompt.to_vec())?,
            (None, None) => return Err(PipelineError::MissingPrompt.into()),
        };
        let batch = prompt_embeds.dim(0)?;
        let prompt_embeds = repeat_per_prompt(
            &prompt_embeds.to_device(device)?.to_dtype(dtype)?,
            num_images_per_prompt,
        )?;
        if !do_cfg {
            return Ok(prompt_embeds);
        }

        let negative_embeds = match (&inputs.negative_prompt_embeds, &inputs.negative_prompt) {
            (Some(embeds), _) => embeds.clone(),
            (None, negative) => {
                let uncond = match (negative, &inputs.prompt) {
                    (None, _) => vec![String::new(); batch],
                    (Some(negative), Some(prompt)) if negative.kind() != prompt.kind() => {
                        return Err(PipelineError::NegativePromptKind {
                            negative: negative.kind(),
                            prompt: prompt.kind(),
                        }
                        .into())
                    }
                    (Some(Prompt::Single(negative)), _) => vec![negative.clone(); batch],
                    (Some(Prompt::Batch(negative)), _) if negative.len() != batch => {
                        return Err(PipelineError::NegativePromptBatch {
                            negative: negative.len(),
                            prompt: batch,
                        }
                        .into())
                    }
                    (Some(Prompt::Batch(negative)), _) => negative.clone(),
                };
                self.text_encoder.encode(&uncond)?
            }
        };
        let negative_embeds = repeat_per_prompt(
            &negative_embeds.to_device(device)?.to_dtype(dtype)?,
            num_images_per_prompt,
        )?;

        Ok(Tensor::cat(&[negative_embeds, prompt_embeds], 0)?)
    }
}

/// Repeat each prompt's embedding `n` times, keeping copies of one prompt adjacent.
fn repeat_per_prompt(embeds: &Tensor, n: usize) -> Result<Tensor> {
    if n == 1 {
        return Ok(embeds.clone());
    }
    let (batch, seq, dim) = embeds.dims3()?;
    Ok(embeds.repeat((1, n, 1))?.reshape((batch * n, seq, dim))?)
}

#[derive(Deserialize)]
struct UnetConfigShim {
    #[serde(default = "default_in_channels")]
    in_channels: usize,
    #[serde(default = "default_sample_size")]
    sample_size: usize,
    cross_attention_dim: usize,
}

fn default_in_channels() -> usize {
    4
}

fn default_sample_size() -> usize {
    64
}

#[derive(Deserialize)]
struct VaeConfigShim {
    #[serde(default = "default_scaling_factor")]
    scaling_factor: f64,
}

fn default_scaling_factor() -> f64 {
    0.18215
}

/// Loads `StableDiffusionImg2ImgPipeline` and `StableDiffusionPipeline` checkpoints.
pub(crate) struct StableDiffusionImg2ImgLoader;

impl Loader for StableDiffusionImg2ImgLoader {
    fn name(&self) -> &'static str {
        "stable diffusion img2img"
    }

    fn required_component_names(&self) -> Vec<ComponentName> {
        vec![
            ComponentName::Scheduler,
            ComponentName::TextEncoder,
            ComponentName::Tokenizer,
            ComponentName::Unet,
            ComponentName::Vae,
        ]
    }

    fn load_from_components(
        &self,
        mut components: HashMap<ComponentName, ComponentElem>,
        ctx: &LoadContext<'_>,
    ) -> Result<Image2ImagePipeline> {
        let mut take = |name: ComponentName| {
            components
                .remove(&name)
                .ok_or_else(|| anyhow::anyhow!("missing component `{name}`"))
        };
        let scheduler = take(ComponentName::Scheduler)?;
        let text_encoder = take(ComponentName::TextEncoder)?;
        let tokenizer = take(ComponentName::Tokenizer)?;
        let unet = take(ComponentName::Unet)?;
        let vae = take(ComponentName::Vae)?;

        let scheduler = if let ComponentElem::Config { files } = scheduler {
            let file = files
                .get("scheduler/scheduler_config.json")
                .ok_or_else(|| anyhow::anyhow!("expected `scheduler/scheduler_config.json`"))?;
            SchedulerConfig::from_json(&file.read_to_string()?)?.build()?
        } else {
            anyhow::bail!("expected scheduler config")
        };

        let (unet_weights, unet_cfg) = if let ComponentElem::Model { weights, config } = unet {
            let cfg: UnetConfigShim = serde_json::from_str(&config.read_to_string()?)?;
            (weights, cfg)
        } else {
            anyhow::bail!("incorrect storage of unet model")
        };
        let version = StableDiffusionVersion::from_cross_attention_dim(unet_cfg.cross_attention_dim)?;
        let sd_config = version.config();
        info!("detected Stable Diffusion {version:?}");

        let tokenizer = match tokenizer {
            ComponentElem::Other { files } | ComponentElem::Config { files }
                if files.contains_key("tokenizer/tokenizer.json") =>
            {
                Tokenizer::from_file(files["tokenizer/tokenizer.json"].path())
                    .map_err(anyhow::Error::msg)?
            }
            _ => {
                let repo = version.tokenizer_repo();
                info!("`tokenizer/tokenizer.json` is missing, fetching it from `{repo}`");
                let loader = FileLoader::from_model_source(
                    &ModelSource::from_model_id(repo),
                    ctx.silent,
                    ctx.token.clone(),
                    None,
                )?;
                Tokenizer::from_file(loader.read_file("tokenizer.json")?.path())
                    .map_err(anyhow::Error::msg)?
            }
        };

        info!("loading CLIP model");
        let text_encoder = if let ComponentElem::Model { weights, .. } = text_encoder {
            ClipPromptEncoder::load(&sd_config, tokenizer, weights.path(), ctx.device, ctx.dtype)?
        } else {
            anyhow::bail!("incorrect storage of clip model")
        };

        info!("loading UNet model");
        let unet = SdUnet::load(
            &sd_config,
            unet_weights.path(),
            unet_cfg.in_channels,
            unet_cfg.sample_size,
            ctx.device,
            ctx.dtype,
        )?;

        info!("loading VAE model");
        let vae = if let ComponentElem::Model { weights, config } = vae {
            let cfg: VaeConfigShim = serde_json::from_str(&config.read_to_string()?)?;
            SdVae::load(
                &sd_config,
                weights.path(),
                cfg.scaling_factor,
                ctx.device,
                ctx.dtype,
            )?
        } else {
            anyhow::bail!("incorrect storage of vae model")
        };

        Ok(Image2ImagePipeline::new(
            Arc::new(unet),
            Arc::new(vae),
            Arc::new(text_encoder),
            scheduler,
        ))
    }
}
