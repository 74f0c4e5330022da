//! Denoising Diffusion Implicit Models, J. Song et al, 2020.
//! https://arxiv.org/abs/2010.02502

use denoise_rs_common::core::{bail, Result, Tensor};
use serde::Deserialize;

use super::{
    linspace, BetaSchedule, PredictionType, Scheduler, StepOptions, TimestepSpacing,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DdimSchedulerConfig {
    /// Number of diffusion steps used to train the model.
    pub num_train_timesteps: usize,
    pub beta_start: f64,
    pub beta_end: f64,
    pub beta_schedule: BetaSchedule,
    /// Use `alpha_cumprod = 1` for the step after the last one instead of the first training alpha.
    pub set_alpha_to_one: bool,
    /// Added to every inference timestep with leading spacing.
    pub steps_offset: usize,
    pub prediction_type: PredictionType,
    pub timestep_spacing: TimestepSpacing,
}

impl Default for DdimSchedulerConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: 1000,
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            set_alpha_to_one: false,
            steps_offset: 1,
            prediction_type: PredictionType::Epsilon,
            timestep_spacing: TimestepSpacing::Leading,
        }
    }
}

fn betas_for_alpha_bar(num_diffusion_timesteps: usize, max_beta: f64) -> Vec<f64> {
    let alpha_bar =
        |t: f64| f64::cos((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).powi(2);
    (0..num_diffusion_timesteps)
        .map(|i| {
            let t1 = i as f64 / num_diffusion_timesteps as f64;
            let t2 = (i + 1) as f64 / num_diffusion_timesteps as f64;
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(max_beta)
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct DdimScheduler {
    config: DdimSchedulerConfig,
    alphas_cumprod: Vec<f64>,
    final_alpha_cumprod: f64,
    timesteps: Vec<f64>,
    num_inference_steps: usize,
}

impl DdimScheduler {
    pub fn new(config: DdimSchedulerConfig) -> Result<Self> {
        if config.num_train_timesteps == 0 {
            bail!("`num_train_timesteps` must be positive");
        }
        let n = config.num_train_timesteps;
        let betas = match config.beta_schedule {
            BetaSchedule::ScaledLinear => linspace(config.beta_start.sqrt(), config.beta_end.sqrt(), n)
                .into_iter()
                .map(|b| b * b)
                .collect(),
            BetaSchedule::Linear => linspace(config.beta_start, config.beta_end, n),
            BetaSchedule::SquaredcosCapV2 => betas_for_alpha_bar(n, 0.999),
        };
        let mut alphas_cumprod = Vec::with_capacity(betas.len());
        for beta in betas {
            let alpha = 1.0 - beta;
            alphas_cumprod.push(alpha * *alphas_cumprod.last().unwrap_or(&1f64));
        }
        let final_alpha_cumprod = if config.set_alpha_to_one {
            1.0
        } else {
            alphas_cumprod[0]
        };
        Ok(Self {
            config,
            alphas_cumprod,
            final_alpha_cumprod,
            timesteps: Vec::new(),
            num_inference_steps: 0,
        })
    }

    pub fn config(&self) -> &DdimSchedulerConfig {
        &self.config
    }

    fn alpha_cumprod_at(&self, timestep: f64) -> f64 {
        let t = (timestep.max(0.) as usize).min(self.alphas_cumprod.len() - 1);
        self.alphas_cumprod[t]
    }
}

impl Scheduler for DdimScheduler {
    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        let train = self.config.num_train_timesteps;
        if num_inference_steps == 0 || num_inference_steps > train {
            bail!("`num_inference_steps` must be in 1..={train}, got {num_inference_steps}");
        }
        let step_ratio = train / num_inference_steps;
        self.timesteps = match self.config.timestep_spacing {
            TimestepSpacing::Leading => (0..num_inference_steps)
                .map(|s| (s * step_ratio + self.config.steps_offset) as f64)
                .rev()
                .collect(),
            TimestepSpacing::Trailing => {
                let ratio = train as f64 / num_inference_steps as f64;
                (0..num_inference_steps)
                    .map(|s| (train as f64 - s as f64 * ratio).round() - 1.)
                    .collect()
            }
            TimestepSpacing::Linspace => linspace(0., (train - 1) as f64, num_inference_steps)
                .into_iter()
                .map(f64::round)
                .rev()
                .collect(),
        };
        self.num_inference_steps = num_inference_steps;
        Ok(())
    }

    fn timesteps(&self) -> &[f64] {
        &self.timesteps
    }

    fn init_noise_sigma(&self) -> f64 {
        1.
    }

    fn accepts_eta(&self) -> bool {
        true
    }

    fn accepts_generator(&self) -> bool {
        true
    }

    fn scale_model_input(&self, sample: Tensor, _timestep: f64) -> Result<Tensor> {
        Ok(sample)
    }

    fn add_noise(&self, original: &Tensor, noise: &Tensor, timestep: f64) -> Result<Tensor> {
        let alpha_prod = self.alpha_cumprod_at(timestep);
        (original * alpha_prod.sqrt())? + (noise * (1.0 - alpha_prod).sqrt())?
    }

    fn step(
        &mut self,
        model_output: &Tensor,
        timestep: f64,
        sample: &Tensor,
        options: StepOptions<'_>,
    ) -> Result<Tensor> {
        if self.num_inference_steps == 0 {
            bail!("`set_timesteps` must be called before stepping");
        }
        let prev_timestep =
            timestep - (self.config.num_train_timesteps / self.num_inference_steps) as f64;

        let alpha_prod_t = self.alpha_cumprod_at(timestep);
        let alpha_prod_t_prev = if prev_timestep >= 0. {
            self.alpha_cumprod_at(prev_timestep)
        } else {
            self.final_alpha_cumprod
        };
        let beta_prod_t = 1. - alpha_prod_t;
        let beta_prod_t_prev = 1. - alpha_prod_t_prev;

        let (pred_original_sample, pred_epsilon) = match self.config.prediction_type {
            PredictionType::Epsilon => {
                let pred_original_sample = ((sample - (model_output * beta_prod_t.sqrt())?)?
                    * (1. / alpha_prod_t.sqrt()))?;
                (pred_original_sample, model_output.clone())
            }
            PredictionType::VPrediction => {
                let pred_original_sample =
                    ((sample * alpha_prod_t.sqrt())? - (model_output * beta_prod_t.sqrt())?)?;
                let pred_epsilon =
                    ((model_output * alpha_prod_t.sqrt())? + (sample * beta_prod_t.sqrt())?)?;
                (pred_original_sample, pred_epsilon)
            }
            PredictionType::Sample => {
                let pred_original_sample = model_output.clone();
                let pred_epsilon = ((sample - (&pred_original_sample * alpha_prod_t.sqrt())?)?
                    * (1. / beta_prod_t.sqrt()))?;
                (pred_original_sample, pred_epsilon)
            }
        };

        let eta = options.eta.unwrap_or(0.);
        let variance = (beta_prod_t_prev / beta_prod_t) * (1. - alpha_prod_t / alpha_prod_t_prev);
        let std_dev_t = eta * variance.sqrt();

        let pred_sample_direction =
            (pred_epsilon * (1. - alpha_prod_t_prev - std_dev_t * std_dev_t).sqrt())?;
        let prev_sample =
            ((pred_original_sample * alpha_prod_t_prev.sqrt())? + pred_sample_direction)?;
        if eta > 0. {
            let noise = match options.generator {
                Some(generator) => {
                    generator.randn(prev_sample.shape(), prev_sample.dtype(), prev_sample.device())?
                }
                None => prev_sample.randn_like(0., 1.)?,
            };
            prev_sample + (noise * std_dev_t)?
        } else {
            Ok(prev_sample)
        }
    }
}

#[cfg(test)]
mod tests {
    use denoise_rs_common::{
        core::{DType, Device},
        Generators,
    };

    use super::*;

    #[test]
    fn leading_spacing_applies_offset() -> Result<()> {
        let mut scheduler = DdimScheduler::new(DdimSchedulerConfig::default())?;
        scheduler.set_timesteps(50)?;
        let timesteps = scheduler.timesteps();
        assert_eq!(timesteps.len(), 50);
        assert_eq!(timesteps[0], 981.);
        assert_eq!(timesteps[49], 1.);
        Ok(())
    }

    #[test]
    fn trailing_and_linspace_spacing() -> Result<()> {
        let mut trailing = DdimScheduler::new(DdimSchedulerConfig {
            timestep_spacing: TimestepSpacing::Trailing,
            ..Default::default()
        })?;
        trailing.set_timesteps(4)?;
        assert_eq!(trailing.timesteps(), &[999., 749., 499., 249.]);

        let mut linspace = DdimScheduler::new(DdimSchedulerConfig {
            timestep_spacing: TimestepSpacing::Linspace,
            ..Default::default()
        })?;
        linspace.set_timesteps(2)?;
        assert_eq!(linspace.timesteps(), &[999., 0.]);
        Ok(())
    }

    #[test]
    fn zero_steps_is_rejected() -> Result<()> {
        let mut scheduler = DdimScheduler::new(DdimSchedulerConfig::default())?;
        assert!(scheduler.set_timesteps(0).is_err());
        Ok(())
    }

    #[test]
    fn deterministic_step_rescales_sample() -> Result<()> {
        let mut scheduler = DdimScheduler::new(DdimSchedulerConfig::default())?;
        scheduler.set_timesteps(10)?;
        let sample = Tensor::ones((1, 1, 2, 2), DType::F64, &Device::Cpu)?;
        let output = sample.zeros_like()?;
        let prev = scheduler.step(&output, 901., &sample, StepOptions::default())?;

        let expected = (scheduler.alphas_cumprod[801] / scheduler.alphas_cumprod[901]).sqrt();
        for v in prev.flatten_all()?.to_vec1::<f64>()? {
            assert!((v - expected).abs() < 1e-9);
        }
        Ok(())
    }

    #[test]
    fn eta_noise_comes_from_the_generator() -> Result<()> {
        let mut scheduler = DdimScheduler::new(DdimSchedulerConfig::default())?;
        scheduler.set_timesteps(10)?;
        let sample = Tensor::ones((1, 4, 2, 2), DType::F32, &Device::Cpu)?;
        let output = (sample.clone() * 0.1)?;

        let mut run = |seed| -> Result<Vec<f32>> {
            let mut gen = Generators::seeded(seed);
            scheduler
                .step(
                    &output,
                    901.,
                    &sample,
                    StepOptions {
                        eta: Some(1.),
                        generator: Some(&mut gen),
                    },
                )?
                .flatten_all()?
                .to_vec1::<f32>()
        };
        let a = run(7)?;
        let b = run(7)?;
        let c = run(8)?;
        assert_eq!(a, b);
        assert_ne!(a, c);
        Ok(())
    }

    #[test]
    fn add_noise_at_timestep() -> Result<()> {
        let scheduler = DdimScheduler::new(DdimSchedulerConfig::default())?;
        let original = Tensor::ones(4, DType::F64, &Device::Cpu)?;
        let noise = Tensor::zeros(4, DType::F64, &Device::Cpu)?;
        let noisy = scheduler.add_noise(&original, &noise, 500.)?;
        let expected = scheduler.alphas_cumprod[500].sqrt();
        for v in noisy.to_vec1::<f64>()? {
            assert!((v - expected).abs() < 1e-12);
        }
        Ok(())
    }
}
