use denoise_rs_common::{core::Tensor, manual_progress_bar, Generators};
use tracing::debug;

use super::{
    guidance::{apply_guidance, expand_for_guidance},
    StepObserver,
};
use crate::{
    models::{Conditioning, DenoisingModel},
    schedulers::{Scheduler, StepOptions},
};

/// The denoising loop shared by the pipelines: scale, predict, guide, step, notify.
pub(crate) struct DenoiseLoop<'a> {
    pub model: &'a dyn DenoisingModel,
    pub conditioning: &'a Conditioning,
    /// `Some` only when classifier-free guidance is enabled.
    pub guidance_scale: Option<f64>,
    /// Steps represented by the schedule, used for progress reporting.
    pub num_inference_steps: usize,
    pub eta: f64,
    pub callback_steps: usize,
    pub silent: bool,
}

/// Progress advances on the last iteration, and past the warmup on every `order`-th iteration.
pub(crate) fn should_update_progress(
    i: usize,
    num_timesteps: usize,
    num_warmup_steps: isize,
    order: usize,
) -> bool {
    #[allow(clippy::cast_possible_wrap)]
    let past_warmup = (i + 1) as isize > num_warmup_steps;
    i + 1 == num_timesteps || (past_warmup && (i + 1) % order == 0)
}

impl DenoiseLoop<'_> {
    pub(crate) fn run(
        &self,
        scheduler: &mut dyn Scheduler,
        timesteps: &[f64],
        mut latents: Tensor,
        generator: &mut Generators,
        observer: &mut dyn StepObserver,
    ) -> anyhow::Result<Tensor> {
        let order = scheduler.order().max(1);
        #[allow(clippy::cast_possible_wrap)]
        let num_warmup_steps =
            timesteps.len() as isize - (self.num_inference_steps * order) as isize;
        let bar = manual_progress_bar(self.num_inference_steps, "Denoise loop", self.silent);

        for (i, &t) in timesteps.iter().enumerate() {
            let model_input = if self.guidance_scale.is_some() {
                expand_for_guidance(&latents)?
            } else {
                latents.clone()
            };
            let model_input = scheduler.scale_model_input(model_input, t)?;

            let noise_pred = self.model.predict(&model_input, t, self.conditioning)?;
            let noise_pred = match self.guidance_scale {
                Some(scale) => apply_guidance(&noise_pred, scale)?,
                None => noise_pred,
            };

            let options = StepOptions {
                eta: scheduler.accepts_eta().then_some(self.eta),
                generator: if scheduler.accepts_generator() {
                    Some(&mut *generator)
                } else {
                    None
                },
            };
            latents = scheduler.step(&noise_pred, t, &latents, options)?;
            debug!("step {i} at timestep {t} done");

            if should_update_progress(i, timesteps.len(), num_warmup_steps, order) {
                bar.inc(1);
            }
            if i % self.callback_steps == 0 || i + 1 == timesteps.len() {
                observer.on_step(i, t, &latents)?;
            }
        }
        bar.finish_and_clear();

        Ok(latents)
    }
}
