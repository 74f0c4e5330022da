//! Core crate for interacting with denoise_rs.
//!
//! Two pipelines are provided: [`Image2ImagePipeline`] transforms an image under a text prompt,
//! and [`ConsistencyModelPipeline`] samples images from noise in one or a few steps. Both run
//! any [`DenoisingModel`] with any [`Scheduler`]. [`Pipeline`] loads a Stable Diffusion
//! checkpoint into an image-to-image pipeline.
//!
//! ```rust,no_run
//! use std::time::Instant;
//!
//! use denoise_rs_core::{Generators, Img2ImgParams, ModelDType, ModelSource, Pipeline, TokenSource};
//!
//! let pipeline = Pipeline::load(
//!     ModelSource::from_model_id("stable-diffusion-v1-5/stable-diffusion-v1-5"),
//!     true,
//!     TokenSource::CacheToken,
//!     None,
//!     &ModelDType::Auto,
//! )?;
//!
//! let start = Instant::now();
//!
//! let image = image::open("sketch.png")?;
//! let images = pipeline.forward(
//!     vec!["A fantasy landscape, trending on artstation".to_string()],
//!     &image,
//!     &Img2ImgParams {
//!         strength: 0.75,
//!         ..Default::default()
//!     },
//!     &mut Generators::seeded(0),
//! )?;
//!
//! let end = Instant::now();
//! println!("Took: {:.2}s", end.duration_since(start).as_secs_f32());
//!
//! images[0].save("image.png")?;
//!
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod models;
pub mod pipelines;
pub mod schedulers;
mod util;

pub use denoise_rs_common::{core, Generator, GeneratorError, Generators, ModelSource, TokenSource};
pub use models::{
    ClipPromptEncoder, Conditioning, DenoisingModel, DiagonalGaussian, LatentDistribution,
    SafetyChecker, SdUnet, SdVae, StableDiffusionVersion, TextEncoder, Vae,
};
pub use pipelines::{
    ClassLabels, ConsistencyInputs, ConsistencyModelPipeline, ConsistencyParams,
    Image2ImagePipeline, ImageArray, ImagePipelineOutput, Img2ImgInputs, Img2ImgParams,
    NoopObserver, OutputType, Pipeline, PipelineError, PipelineImages, Prompt, StepObserver,
};
pub use schedulers::{Scheduler, SchedulerConfig, StepOptions};
pub use util::{ModelDType, TryIntoDType};
