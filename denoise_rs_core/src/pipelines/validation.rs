use denoise_rs_common::{core::Tensor, GeneratorError};
use thiserror::Error;
use tracing::warn;

use super::{
    consistency::{ClassLabels, ConsistencyParams},
    img2img::{Img2ImgInputs, Img2ImgParams},
    OutputType,
};

/// Invalid call parameters. Raised before any model is invoked.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PipelineError {
    #[error("The value of strength should in [0.0, 1.0] but is {0}")]
    InvalidStrength(f64),
    #[error("`callback_steps` has to be a positive integer but is {0}.")]
    InvalidCallbackSteps(usize),
    #[error("`num_images_per_prompt` has to be a positive integer but is {0}.")]
    InvalidImagesPerPrompt(usize),
    #[error("`batch_size` has to be a positive integer but is {0}.")]
    InvalidBatchSize(usize),
    #[error("Cannot forward both `prompt` and `prompt_embeds`. Please make sure to only forward one of the two.")]
    PromptAndEmbeds,
    #[error("Provide either `prompt` or `prompt_embeds`. Cannot leave both `prompt` and `prompt_embeds` undefined.")]
    MissingPrompt,
    #[error("Cannot forward both `negative_prompt` and `negative_prompt_embeds`. Please make sure to only forward one of the two.")]
    NegativePromptAndEmbeds,
    #[error("`prompt_embeds` and `negative_prompt_embeds` must have the same shape when passed directly, but got: `prompt_embeds` {prompt:?} != `negative_prompt_embeds` {negative:?}.")]
    EmbedsShapeMismatch {
        prompt: Vec<usize>,
        negative: Vec<usize>,
    },
    #[error("`negative_prompt` should be the same type as `prompt`, but got a {negative} negative prompt for a {prompt} prompt.")]
    NegativePromptKind {
        negative: &'static str,
        prompt: &'static str,
    },
    #[error("`negative_prompt` has batch size {negative}, but `prompt` has batch size {prompt}. Please make sure that passed `negative_prompt` matches the batch size of `prompt`.")]
    NegativePromptBatch { negative: usize, prompt: usize },
    #[error("Cannot duplicate `image` of batch size {images} to {batch_size} text prompts.")]
    ImageBatch { images: usize, batch_size: usize },
    #[error("Exactly one of `num_inference_steps` or `timesteps` must be supplied.")]
    MissingSchedule,
    #[error("The shape of latents is {got:?} but is expected to be {expected:?}.")]
    LatentsShape { got: Vec<usize>, expected: Vec<usize> },
    #[error("Batch size must be 1 if classes is an int, got {0}.")]
    SingleClassLabel(usize),
    #[error("Got {got} class labels for a batch of {expected}.")]
    ClassLabelCount { got: usize, expected: usize },
    #[error("output_type={0} is not supported. Make sure to choose one of ['tensor', 'array', 'image', 'latent'].")]
    InvalidOutputType(String),
    #[error("output_type={0} is not supported by this pipeline.")]
    UnsupportedOutputType(OutputType),
    #[error(transparent)]
    Generator(#[from] GeneratorError),
}

fn check_callback_steps(callback_steps: usize) -> Result<(), PipelineError> {
    if callback_steps == 0 {
        return Err(PipelineError::InvalidCallbackSteps(callback_steps));
    }
    Ok(())
}

pub(crate) fn check_img2img_inputs(
    inputs: &Img2ImgInputs,
    params: &Img2ImgParams,
) -> Result<(), PipelineError> {
    if !(0.0..=1.0).contains(&params.strength) {
        return Err(PipelineError::InvalidStrength(params.strength));
    }
    check_callback_steps(params.callback_steps)?;
    if params.num_images_per_prompt == 0 {
        return Err(PipelineError::InvalidImagesPerPrompt(0));
    }

    match (&inputs.prompt, &inputs.prompt_embeds) {
        (Some(_), Some(_)) => return Err(PipelineError::PromptAndEmbeds),
        (None, None) => return Err(PipelineError::MissingPrompt),
        (Some(prompt), None) if prompt.is_empty() => return Err(PipelineError::MissingPrompt),
        _ => (),
    }
    if inputs.negative_prompt.is_some() && inputs.negative_prompt_embeds.is_some() {
        return Err(PipelineError::NegativePromptAndEmbeds);
    }
    if let (Some(prompt), Some(negative)) = (&inputs.prompt_embeds, &inputs.negative_prompt_embeds) {
        check_same_shape(prompt, negative)?;
    }
    Ok(())
}

fn check_same_shape(prompt: &Tensor, negative: &Tensor) -> Result<(), PipelineError> {
    if prompt.dims() != negative.dims() {
        return Err(PipelineError::EmbedsShapeMismatch {
            prompt: prompt.dims().to_vec(),
            negative: negative.dims().to_vec(),
        });
    }
    Ok(())
}

/// `expected_latents_shape` is `(batch, channels, size, size)` for the model being sampled.
pub(crate) fn check_consistency_inputs(
    params: &ConsistencyParams,
    latents: Option<&Tensor>,
    class_labels: Option<&ClassLabels>,
    expected_latents_shape: [usize; 4],
) -> Result<(), PipelineError> {
    if params.batch_size == 0 {
        return Err(PipelineError::InvalidBatchSize(0));
    }
    match (params.num_inference_steps, &params.timesteps) {
        (None, None) => return Err(PipelineError::MissingSchedule),
        (Some(steps), Some(timesteps)) => warn!(
            "Both `num_inference_steps`: {steps} and `timesteps`: {timesteps:?} are supplied; `timesteps` will be used over `num_inference_steps`."
        ),
        _ => (),
    }
    if let Some(latents) = latents {
        if latents.dims() != expected_latents_shape.as_slice() {
            return Err(PipelineError::LatentsShape {
                got: latents.dims().to_vec(),
                expected: expected_latents_shape.to_vec(),
            });
        }
    }
    match class_labels {
        Some(ClassLabels::Single(_)) if params.batch_size != 1 => {
            return Err(PipelineError::SingleClassLabel(params.batch_size))
        }
        Some(ClassLabels::Batch(labels)) if labels.len() != params.batch_size => {
            return Err(PipelineError::ClassLabelCount {
                got: labels.len(),
                expected: params.batch_size,
            })
        }
        _ => (),
    }
    check_callback_steps(params.callback_steps)
}
