mod consistency;
mod denoise;
mod guidance;
mod image_processor;
mod img2img;
mod latents;
mod timesteps;
mod validation;

use std::{collections::HashMap, fmt::Display, str::FromStr, sync::Mutex};

use anyhow::Result;
use denoise_rs_common::{
    core::{DType, Device, Tensor},
    FileData, FileLoader, Generators, ModelSource, NiceProgressBar, TokenSource,
};
use image::DynamicImage;
use serde::Deserialize;
use tracing::{info, Dispatch};

use crate::util::{ModelDType, TryIntoDType};

pub use consistency::{ClassLabels, ConsistencyInputs, ConsistencyModelPipeline, ConsistencyParams};
pub use guidance::{apply_guidance, do_classifier_free_guidance, expand_for_guidance};
pub use image_processor::{denormalize, postprocess, preprocess};
pub use img2img::{Image2ImagePipeline, Img2ImgInputs, Img2ImgParams};
pub use timesteps::strength_schedule;
pub use validation::PipelineError;

use img2img::StableDiffusionImg2ImgLoader;

/// Requested representation of the generated images.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
pub enum OutputType {
    /// The denormalized `(b, c, h, w)` tensor.
    #[serde(rename = "tensor", alias = "pd", alias = "pt")]
    Tensor,
    /// A channels-last `f32` buffer.
    #[serde(rename = "array", alias = "np")]
    Array,
    #[default]
    #[serde(rename = "image", alias = "pil")]
    Image,
    /// The final latents, without decoding.
    #[serde(rename = "latent")]
    Latent,
}

impl FromStr for OutputType {
    type Err = PipelineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        serde_plain::from_str(s).map_err(|_| PipelineError::InvalidOutputType(s.to_string()))
    }
}

impl Display for OutputType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tensor => write!(f, "tensor"),
            Self::Array => write!(f, "array"),
            Self::Image => write!(f, "image"),
            Self::Latent => write!(f, "latent"),
        }
    }
}

/// A channels-last image batch with values in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageArray {
    /// `(batch, height, width, channels)`
    pub shape: (usize, usize, usize, usize),
    pub data: Vec<f32>,
}

#[derive(Debug, Clone)]
pub enum PipelineImages {
    Tensor(Tensor),
    Array(ImageArray),
    Images(Vec<DynamicImage>),
    Latent(Tensor),
}

impl PipelineImages {
    pub fn into_images(self) -> Result<Vec<DynamicImage>> {
        match self {
            Self::Images(images) => Ok(images),
            _ => anyhow::bail!("pipeline output is not a list of images"),
        }
    }

    pub fn into_tensor(self) -> Result<Tensor> {
        match self {
            Self::Tensor(t) | Self::Latent(t) => Ok(t),
            _ => anyhow::bail!("pipeline output is not a tensor"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImagePipelineOutput {
    pub images: PipelineImages,
    /// One flag per image when a safety checker ran, `None` otherwise.
    pub nsfw_content_detected: Option<Vec<bool>>,
}

/// One prompt or a batch of prompts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prompt {
    Single(String),
    Batch(Vec<String>),
}

impl Prompt {
    pub fn len(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Batch(prompts) => prompts.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::Single(prompt) => vec![prompt.clone()],
            Self::Batch(prompts) => prompts.clone(),
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Single(_) => "single",
            Self::Batch(_) => "batched",
        }
    }
}

impl From<&str> for Prompt {
    fn from(value: &str) -> Self {
        Self::Single(value.to_string())
    }
}

impl From<String> for Prompt {
    fn from(value: String) -> Self {
        Self::Single(value)
    }
}

impl From<Vec<String>> for Prompt {
    fn from(value: Vec<String>) -> Self {
        Self::Batch(value)
    }
}

impl From<Vec<&str>> for Prompt {
    fn from(value: Vec<&str>) -> Self {
        Self::Batch(value.into_iter().map(ToString::to_string).collect())
    }
}

/// Observes the latents during denoising. Called every `callback_steps` iterations and on the
/// final one. Returning an error aborts the generation.
pub trait StepObserver {
    fn on_step(&mut self, step: usize, timestep: f64, latents: &Tensor) -> Result<()>;
}

/// Observer that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl StepObserver for NoopObserver {
    fn on_step(&mut self, _step: usize, _timestep: f64, _latents: &Tensor) -> Result<()> {
        Ok(())
    }
}

impl<F> StepObserver for F
where
    F: FnMut(usize, f64, &Tensor) -> Result<()>,
{
    fn on_step(&mut self, step: usize, timestep: f64, latents: &Tensor) -> Result<()> {
        self(step, timestep, latents)
    }
}

/// The dispatcher in scope right now, used as a pipeline's default log sink.
pub(crate) fn current_log_sink() -> Dispatch {
    tracing::dispatcher::get_default(Dispatch::clone)
}

#[derive(Debug)]
pub(crate) enum ComponentElem {
    Model {
        weights: FileData,
        config: FileData,
    },
    Config {
        files: HashMap<String, FileData>,
    },
    Other {
        files: HashMap<String, FileData>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ComponentName {
    Scheduler,
    TextEncoder,
    Tokenizer,
    Unet,
    Vae,
}

impl Display for ComponentName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scheduler => write!(f, "scheduler"),
            Self::TextEncoder => write!(f, "text_encoder"),
            Self::Tokenizer => write!(f, "tokenizer"),
            Self::Unet => write!(f, "unet"),
            Self::Vae => write!(f, "vae"),
        }
    }
}

/// Settings shared by the component loaders.
pub(crate) struct LoadContext<'a> {
    pub device: &'a Device,
    pub dtype: DType,
    pub silent: bool,
    pub token: TokenSource,
}

pub(crate) trait Loader {
    fn name(&self) -> &'static str;
    fn required_component_names(&self) -> Vec<ComponentName>;
    fn load_from_components(
        &self,
        components: HashMap<ComponentName, ComponentElem>,
        ctx: &LoadContext<'_>,
    ) -> Result<Image2ImagePipeline>;
}

#[derive(Clone, Debug, Deserialize)]
struct ModelIndex {
    #[serde(rename = "_class_name")]
    name: String,
}

/// Pick the weights file of a model component, preferring `fp16` variants for half precision.
fn select_weights(files: &[String], dir: &str, dtype: DType) -> Option<String> {
    let stems = ["diffusion_pytorch_model", "model"];
    let half = matches!(dtype, DType::F16 | DType::BF16);
    let mut candidates = Vec::new();
    for stem in stems {
        if half {
            candidates.push(format!("{dir}{stem}.fp16.safetensors"));
        }
        candidates.push(format!("{dir}{stem}.safetensors"));
    }
    candidates.into_iter().find(|c| files.contains(c))
}

/// A loaded image-to-image pipeline.
pub struct Pipeline {
    model: Mutex<Image2ImagePipeline>,
    device: Device,
}

impl Pipeline {
    /// Load the model.
    ///
    /// Note:
    /// - `token` and `revision` are only applicable for Hugging Face models.
    pub fn load(
        source: ModelSource,
        silent: bool,
        token: TokenSource,
        revision: Option<String>,
        dtype: &ModelDType,
    ) -> Result<Self> {
        info!("loading from source: {source}.");

        #[cfg(not(feature = "metal"))]
        let device = Device::cuda_if_available(0)?;
        #[cfg(feature = "metal")]
        let device = Device::new_metal(0)?;

        let dtype = dtype.try_into_dtype(&[&device], silent)?;

        let loader = FileLoader::from_model_source(&source, silent, token.clone(), revision)?;
        let files = loader.list_files()?;
        if !files.contains(&"model_index.json".to_string()) {
            anyhow::bail!("Expected `model_index.json` file present.");
        }
        let ModelIndex { name } =
            serde_json::from_str(&loader.read_file("model_index.json")?.read_to_string()?)?;

        let model_loader: Box<dyn Loader> = match name.as_str() {
            "StableDiffusionImg2ImgPipeline" | "StableDiffusionPipeline" => {
                Box::new(StableDiffusionImg2ImgLoader)
            }
            "ConsistencyModelPipeline" => anyhow::bail!(
                "consistency models have no bundled network; build a `ConsistencyModelPipeline` from a `DenoisingModel` instead"
            ),
            other => anyhow::bail!("Unexpected loader type `{other:?}`."),
        };
        info!("model architecture is: {}", model_loader.name());

        let mut components = HashMap::new();
        for component in NiceProgressBar::<_, 'g'>(
            model_loader.required_component_names().into_iter(),
            "Loading components",
        ) {
            let dir = format!("{component}/");
            let files_for_component = files
                .iter()
                .filter(|file| file.starts_with(&dir))
                .cloned()
                .collect::<Vec<_>>();

            // Model: has weights and a config.json
            // Config: only json files
            // Other: anything else, e.g. tokenizer vocabularies
            let component_elem = if let Some(weights) = select_weights(&files_for_component, &dir, dtype) {
                ComponentElem::Model {
                    weights: loader.read_file(&weights)?,
                    config: loader.read_file(&format!("{dir}config.json"))?,
                }
            } else if files_for_component.iter().all(|file| file.ends_with(".json")) {
                let mut files = HashMap::new();
                for file in &files_for_component {
                    files.insert(file.clone(), loader.read_file(file)?);
                }
                ComponentElem::Config { files }
            } else {
                let mut files = HashMap::new();
                for file in &files_for_component {
                    files.insert(file.clone(), loader.read_file(file)?);
                }
                ComponentElem::Other { files }
            };
            components.insert(component, component_elem);
        }

        let ctx = LoadContext {
            device: &device,
            dtype,
            silent,
            token,
        };
        let model = model_loader.load_from_components(components, &ctx)?.with_silent(silent);

        Ok(Self {
            model: Mutex::new(model),
            device,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Run image-to-image generation on explicit inputs.
    pub fn generate(
        &self,
        inputs: &Img2ImgInputs,
        params: &Img2ImgParams,
        generator: &mut Generators,
    ) -> Result<ImagePipelineOutput> {
        let mut model = self
            .model
            .lock()
            .map_err(|_| anyhow::anyhow!("Could not lock model!"))?;
        #[cfg(feature = "metal")]
        let out = objc::rc::autoreleasepool(|| model.generate(inputs, params, generator))?;
        #[cfg(not(feature = "metal"))]
        let out = model.generate(inputs, params, generator)?;
        Ok(out)
    }

    /// Transform `image` according to `prompts`, returning one image per prompt and
    /// `params.num_images_per_prompt`.
    pub fn forward(
        &self,
        prompts: Vec<String>,
        image: &DynamicImage,
        params: &Img2ImgParams,
        generator: &mut Generators,
    ) -> Result<Vec<DynamicImage>> {
        let image = preprocess(image, &self.device)?;
        let inputs = Img2ImgInputs::from_prompt(prompts, image);
        let params = Img2ImgParams {
            output_type: OutputType::Image,
            ..params.clone()
        };
        self.generate(&inputs, &params, generator)?.images.into_images()
    }
}
