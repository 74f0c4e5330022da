use std::sync::Arc;

use anyhow::Result;
use denoise_rs_common::{
    core::{Device, Tensor},
    Generators,
};
use tracing::{info, warn, Dispatch};

use super::{
    current_log_sink,
    denoise::DenoiseLoop,
    image_processor::postprocess,
    latents::prepare_consistency_latents,
    validation::{check_consistency_inputs, PipelineError},
    ImagePipelineOutput, NoopObserver, OutputType, StepObserver,
};
use crate::{
    models::{Conditioning, DenoisingModel, SafetyChecker},
    schedulers::Scheduler,
};

/// Class conditioning of a consistency model call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassLabels {
    /// One label, only valid for a batch of one.
    Single(u32),
    /// One label per sample.
    Batch(Vec<u32>),
}

/// Call parameters of [`ConsistencyModelPipeline::generate`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConsistencyParams {
    pub batch_size: usize,
    pub num_inference_steps: Option<usize>,
    /// Explicit descending training timesteps. Takes precedence over `num_inference_steps`.
    pub timesteps: Option<Vec<usize>>,
    pub output_type: OutputType,
    pub callback_steps: usize,
}

impl Default for ConsistencyParams {
    fn default() -> Self {
        Self {
            batch_size: 1,
            num_inference_steps: Some(1),
            timesteps: None,
            output_type: OutputType::Image,
            callback_steps: 1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConsistencyInputs {
    /// Random labels are drawn for class-conditional models when this is `None`.
    pub class_labels: Option<ClassLabels>,
    /// Starting noise of shape `(batch_size, in_channels, sample_size, sample_size)`.
    pub latents: Option<Tensor>,
}

/// Unconditional or class-conditional sampling with a consistency model, in one or a few steps.
/// The model works directly in pixel space.
pub struct ConsistencyModelPipeline {
    unet: Arc<dyn DenoisingModel>,
    scheduler: Box<dyn Scheduler>,
    safety_checker: Option<Arc<dyn SafetyChecker>>,
    log: Dispatch,
    silent: bool,
}

impl ConsistencyModelPipeline {
    pub fn new(unet: Arc<dyn DenoisingModel>, scheduler: Box<dyn Scheduler>) -> Self {
        Self {
            unet,
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

    pub fn with_log_sink(mut self, log: Dispatch) -> Self {
        self.log = log;
        self
    }

    pub fn with_silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    pub fn scheduler(&self) -> &dyn Scheduler {
        self.scheduler.as_ref()
    }

    pub fn generate(
        &mut self,
        inputs: &ConsistencyInputs,
        params: &ConsistencyParams,
        generator: &mut Generators,
    ) -> Result<ImagePipelineOutput> {
        self.generate_with_observer(inputs, params, generator, &mut NoopObserver)
    }

    pub fn generate_with_observer(
        &mut self,
        inputs: &ConsistencyInputs,
        params: &ConsistencyParams,
        generator: &mut Generators,
        observer: &mut dyn StepObserver,
    ) -> Result<ImagePipelineOutput> {
        let log = self.log.clone();
        tracing::dispatcher::with_default(&log, || self.run(inputs, params, generator, observer))
    }

    fn run(
        &mut self,
        inputs: &ConsistencyInputs,
        params: &ConsistencyParams,
        generator: &mut Generators,
        observer: &mut dyn StepObserver,
    ) -> Result<ImagePipelineOutput> {
        // There is no decoder, so the final sample is already the image.
        if params.output_type == OutputType::Latent {
            return Err(PipelineError::UnsupportedOutputType(params.output_type).into());
        }

        let size = self.unet.sample_size();
        let shape = (params.batch_size, self.unet.in_channels(), size, size);
        check_consistency_inputs(
            params,
            inputs.latents.as_ref(),
            inputs.class_labels.as_ref(),
            [shape.0, shape.1, shape.2, shape.3],
        )?;

        let device = self.unet.device().clone();
        let latents = prepare_consistency_latents(
            shape,
            self.unet.dtype(),
            &device,
            generator,
            inputs.latents.as_ref(),
            self.scheduler.init_noise_sigma(),
        )?;
        let class_labels = self.prepare_class_labels(
            params.batch_size,
            inputs.class_labels.as_ref(),
            &device,
            generator,
        )?;

        match (&params.timesteps, params.num_inference_steps) {
            (Some(timesteps), _) => self.scheduler.set_custom_timesteps(timesteps)?,
            (None, Some(steps)) => self.scheduler.set_timesteps(steps)?,
            (None, None) => return Err(PipelineError::MissingSchedule.into()),
        }
        let timesteps = self.scheduler.timesteps().to_vec();
        info!("sampling {} images in {} steps", params.batch_size, timesteps.len());

        let conditioning = Conditioning {
            encoder_hidden_states: None,
            class_labels,
        };
        let sample = DenoiseLoop {
            model: self.unet.as_ref(),
            conditioning: &conditioning,
            guidance_scale: None,
            num_inference_steps: timesteps.len(),
            eta: 0.0,
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

        let (sample, nsfw_content_detected) = match &self.safety_checker {
            Some(checker) => {
                let (sample, flags) = checker.check(&sample)?;
                (sample, Some(flags))
            }
            None => (sample, None),
        };
        let images = postprocess(&sample, params.output_type, nsfw_content_detected.as_deref())?;
        Ok(ImagePipelineOutput {
            images,
            nsfw_content_detected,
        })
    }

    /// `(batch_size,)` labels for class-conditional models, `None` for unconditional ones.
    fn prepare_class_labels(
        &self,
        batch_size: usize,
        class_labels: Option<&ClassLabels>,
        device: &Device,
        generator: &mut Generators,
    ) -> Result<Option<Tensor>> {
        let Some(num_classes) = self.unet.num_class_embeds() else {
            if class_labels.is_some() {
                warn!("The model is not class-conditional, ignoring `class_labels`.");
            }
            return Ok(None);
        };
        let labels = match class_labels {
            Some(ClassLabels::Batch(labels)) => labels.clone(),
            Some(ClassLabels::Single(label)) => vec![*label],
            None => {
                #[allow(clippy::cast_possible_truncation)]
                let high = num_classes as u32;
                generator.randint(high, batch_size)?
            }
        };
        Ok(Some(Tensor::from_vec(labels, batch_size, device)?))
    }
}

#[cfg(test)]
mod tests {
    use denoise_rs_common::core::{DType, Result as CandleResult};

    use super::*;
    use crate::schedulers::{CmStochasticIterativeScheduler, CmStochasticIterativeSchedulerConfig};

    /// Predicts zeros.
    struct ClassModel {
        classes: Option<usize>,
        device: Device,
    }

    impl DenoisingModel for ClassModel {
        fn predict(&self, sample: &Tensor, _t: f64, _c: &Conditioning) -> CandleResult<Tensor> {
            sample.zeros_like()
        }
        fn in_channels(&self) -> usize {
            3
        }
        fn sample_size(&self) -> usize {
            4
        }
        fn num_class_embeds(&self) -> Option<usize> {
            self.classes
        }
        fn dtype(&self) -> DType {
            DType::F32
        }
        fn device(&self) -> &Device {
            &self.device
        }
    }

    fn pipeline(classes: Option<usize>) -> ConsistencyModelPipeline {
        ConsistencyModelPipeline::new(
            Arc::new(ClassModel {
                classes,
                device: Device::Cpu,
            }),
            Box::new(CmStochasticIterativeScheduler::new(
                CmStochasticIterativeSchedulerConfig::default(),
            )),
        )
        .with_silent(true)
    }

    #[test]
    fn random_labels_stay_below_class_count() -> anyhow::Result<()> {
        let pipeline = pipeline(Some(10));
        let labels = pipeline
            .prepare_class_labels(4, None, &Device::Cpu, &mut Generators::seeded(2))?
            .ok_or_else(|| anyhow::anyhow!("expected labels"))?;
        assert_eq!(labels.dims(), &[4]);
        assert!(labels.to_vec1::<u32>()?.iter().all(|l| *l < 10));
        Ok(())
    }

    #[test]
    fn explicit_labels_are_used() -> anyhow::Result<()> {
        let pipeline = pipeline(Some(10));
        let labels = pipeline
            .prepare_class_labels(
                2,
                Some(&ClassLabels::Batch(vec![7, 3])),
                &Device::Cpu,
                &mut Generators::seeded(0),
            )?
            .ok_or_else(|| anyhow::anyhow!("expected labels"))?;
        assert_eq!(labels.to_vec1::<u32>()?, vec![7, 3]);
        Ok(())
    }

    #[test]
    fn unconditional_models_get_no_labels() -> anyhow::Result<()> {
        let pipeline = pipeline(None);
        let labels = pipeline.prepare_class_labels(
            1,
            Some(&ClassLabels::Single(1)),
            &Device::Cpu,
            &mut Generators::seeded(0),
        )?;
        assert!(labels.is_none());
        Ok(())
    }

    #[test]
    fn latent_output_is_rejected() {
        let mut pipeline = pipeline(None);
        let params = ConsistencyParams {
            output_type: OutputType::Latent,
            ..Default::default()
        };
        let err = pipeline
            .generate(&ConsistencyInputs::default(), &params, &mut Generators::seeded(0))
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<PipelineError>(),
            Some(&PipelineError::UnsupportedOutputType(OutputType::Latent))
        );
    }

    #[test]
    fn tensor_output_has_model_shape() -> anyhow::Result<()> {
        let mut pipeline = pipeline(Some(5));
        let params = ConsistencyParams {
            batch_size: 2,
            output_type: OutputType::Tensor,
            ..Default::default()
        };
        let out = pipeline.generate(&ConsistencyInputs::default(), &params, &mut Generators::seeded(0))?;
        assert_eq!(out.images.into_tensor()?.dims(), &[2, 3, 4, 4]);
        Ok(())
    }
}
