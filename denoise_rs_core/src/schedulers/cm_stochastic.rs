//! Multistep and onestep sampling for consistency models, Y. Song et al, 2023.
//! https://arxiv.org/abs/2303.01469

use denoise_rs_common::core::{bail, Result, Tensor};
use serde::Deserialize;

use super::{index_for_timestep, Scheduler, StepOptions};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CmStochasticIterativeSchedulerConfig {
    pub num_train_timesteps: usize,
    pub sigma_min: f64,
    pub sigma_max: f64,
    /// Standard deviation of the data distribution, 0.5 in EDM.
    pub sigma_data: f64,
    /// Extra noise scale applied when re-noising between steps.
    pub s_noise: f64,
    /// Karras schedule parameter.
    pub rho: f64,
    /// Clamp the denoised sample to `[-1, 1]`.
    pub clip_denoised: bool,
}

impl Default for CmStochasticIterativeSchedulerConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: 40,
            sigma_min: 0.002,
            sigma_max: 80.0,
            sigma_data: 0.5,
            s_noise: 1.0,
            rho: 7.0,
            clip_denoised: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CmStochasticIterativeScheduler {
    config: CmStochasticIterativeSchedulerConfig,
    timesteps: Vec<f64>,
    /// One more entry than `timesteps`, ending in `sigma_min`.
    sigmas: Vec<f64>,
}

impl CmStochasticIterativeScheduler {
    pub fn new(config: CmStochasticIterativeSchedulerConfig) -> Self {
        let mut scheduler = Self {
            config,
            timesteps: Vec::new(),
            sigmas: Vec::new(),
        };
        let n = scheduler.config.num_train_timesteps;
        let full = (0..n).rev().collect::<Vec<_>>();
        scheduler.apply_timesteps(&full);
        scheduler
    }

    pub fn config(&self) -> &CmStochasticIterativeSchedulerConfig {
        &self.config
    }

    pub fn sigmas(&self) -> &[f64] {
        &self.sigmas
    }

    /// Karras et al. noise levels for ramp values in `[0, 1]`, `sigma_max` at 0.
    fn karras_sigmas(&self, ramp: &[f64]) -> Vec<f64> {
        let rho = self.config.rho;
        let min_inv_rho = self.config.sigma_min.powf(1. / rho);
        let max_inv_rho = self.config.sigma_max.powf(1. / rho);
        ramp.iter()
            .map(|r| (max_inv_rho + r * (min_inv_rho - max_inv_rho)).powf(rho))
            .collect()
    }

    fn sigma_to_t(sigma: f64) -> f64 {
        1000. * 0.25 * (sigma + 1e-44).ln()
    }

    fn apply_timesteps(&mut self, timesteps: &[usize]) {
        let denom = self.config.num_train_timesteps.saturating_sub(1).max(1) as f64;
        let ramp = timesteps
            .iter()
            .rev()
            .map(|t| *t as f64 / denom)
            .collect::<Vec<_>>();
        let mut sigmas = self.karras_sigmas(&ramp);
        self.timesteps = sigmas.iter().map(|s| Self::sigma_to_t(*s)).collect();
        sigmas.push(self.config.sigma_min);
        self.sigmas = sigmas;
    }

    /// Boundary-condition scalings `(c_skip, c_out)` for a noise level.
    fn scalings_for_boundary_conditions(&self, sigma: f64) -> (f64, f64) {
        let sigma_min = self.config.sigma_min;
        let sigma_data = self.config.sigma_data;
        let c_skip = sigma_data.powi(2) / ((sigma - sigma_min).powi(2) + sigma_data.powi(2));
        let c_out = (sigma - sigma_min) * sigma_data / (sigma.powi(2) + sigma_data.powi(2)).sqrt();
        (c_skip, c_out)
    }
}

impl Scheduler for CmStochasticIterativeScheduler {
    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        let train = self.config.num_train_timesteps;
        if num_inference_steps == 0 || num_inference_steps > train {
            bail!("`num_inference_steps` must be in 1..={train}, got {num_inference_steps}");
        }
        let step_ratio = train / num_inference_steps;
        let timesteps = (0..num_inference_steps)
            .map(|s| s * step_ratio)
            .rev()
            .collect::<Vec<_>>();
        self.apply_timesteps(&timesteps);
        Ok(())
    }

    fn set_custom_timesteps(&mut self, timesteps: &[usize]) -> Result<()> {
        if timesteps.is_empty() {
            bail!("`timesteps` must not be empty");
        }
        if timesteps.windows(2).any(|w| w[1] >= w[0]) {
            bail!("`timesteps` must be in descending order.");
        }
        let train = self.config.num_train_timesteps;
        if timesteps[0] >= train {
            bail!("`timesteps` must start before `num_train_timesteps`: {train}.");
        }
        self.apply_timesteps(timesteps);
        Ok(())
    }

    fn timesteps(&self) -> &[f64] {
        &self.timesteps
    }

    fn init_noise_sigma(&self) -> f64 {
        self.config.sigma_max
    }

    fn accepts_generator(&self) -> bool {
        true
    }

    fn scale_model_input(&self, sample: Tensor, timestep: f64) -> Result<Tensor> {
        let sigma = self.sigmas[index_for_timestep(&self.timesteps, timestep)?];
        sample / (sigma.powi(2) + self.config.sigma_data.powi(2)).sqrt()
    }

    fn add_noise(&self, original: &Tensor, noise: &Tensor, timestep: f64) -> Result<Tensor> {
        let sigma = self.sigmas[index_for_timestep(&self.timesteps, timestep)?];
        original + (noise * sigma)?
    }

    fn step(
        &mut self,
        model_output: &Tensor,
        timestep: f64,
        sample: &Tensor,
        options: StepOptions<'_>,
    ) -> Result<Tensor> {
        let step_index = index_for_timestep(&self.timesteps, timestep)?;
        let sigma_min = self.config.sigma_min;
        let sigma_max = self.config.sigma_max;

        let sigma = self.sigmas[step_index];
        let sigma_next = self.sigmas[step_index + 1];

        let (c_skip, c_out) = self.scalings_for_boundary_conditions(sigma);
        let mut denoised = ((model_output * c_out)? + (sample * c_skip)?)?;
        if self.config.clip_denoised {
            denoised = denoised.clamp(-1f32, 1f32)?;
        }

        // Single-step sampling is deterministic.
        let noise = if self.timesteps.len() > 1 {
            match options.generator {
                Some(generator) => {
                    generator.randn(model_output.shape(), model_output.dtype(), model_output.device())?
                }
                None => model_output.randn_like(0., 1.)?,
            }
        } else {
            model_output.zeros_like()?
        };
        let z = (noise * self.config.s_noise)?;

        let sigma_hat = sigma_next.clamp(sigma_min, sigma_max);
        denoised + (z * (sigma_hat.powi(2) - sigma_min.powi(2)).sqrt())?
    }
}

#[cfg(test)]
mod tests {
    use denoise_rs_common::{
        core::{DType, Device},
        Generator, Generators,
    };

    use super::*;

    fn scheduler() -> CmStochasticIterativeScheduler {
        CmStochasticIterativeScheduler::new(CmStochasticIterativeSchedulerConfig::default())
    }

    #[test]
    fn single_step_starts_at_sigma_max() -> Result<()> {
        let mut scheduler = scheduler();
        scheduler.set_timesteps(1)?;
        let sigmas = scheduler.sigmas();
        assert_eq!(sigmas.len(), 2);
        assert!((sigmas[0] - 80.0).abs() < 1e-9);
        assert_eq!(sigmas[1], 0.002);
        assert_eq!(scheduler.timesteps().len(), 1);
        assert!((scheduler.timesteps()[0] - 250. * 80f64.ln()).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn custom_timesteps_follow_the_karras_ramp() -> Result<()> {
        let mut scheduler = scheduler();
        scheduler.set_custom_timesteps(&[22, 0])?;
        let sigmas = scheduler.sigmas();
        assert_eq!(sigmas.len(), 3);
        assert!((sigmas[0] - 80.0).abs() < 1e-9);
        let (min_inv_rho, max_inv_rho) = (0.002f64.powf(1. / 7.), 80f64.powf(1. / 7.));
        let expected = (max_inv_rho + 22. / 39. * (min_inv_rho - max_inv_rho)).powf(7.);
        assert!((sigmas[1] - expected).abs() < 1e-12);
        assert!(sigmas[0] > sigmas[1]);
        Ok(())
    }

    #[test]
    fn custom_timesteps_are_validated() {
        let mut scheduler = scheduler();
        assert!(scheduler.set_custom_timesteps(&[0, 22]).is_err());
        assert!(scheduler.set_custom_timesteps(&[22, 22]).is_err());
        assert!(scheduler.set_custom_timesteps(&[40, 0]).is_err());
        assert!(scheduler.set_custom_timesteps(&[]).is_err());
    }

    #[test]
    fn scale_model_input_uses_sigma() -> Result<()> {
        let mut scheduler = scheduler();
        scheduler.set_timesteps(1)?;
        let t = scheduler.timesteps()[0];
        let sample = Tensor::ones(3, DType::F64, &Device::Cpu)?;
        let scaled = scheduler.scale_model_input(sample, t)?.to_vec1::<f64>()?;
        let expected = 1. / (80f64.powi(2) + 0.25).sqrt();
        assert!(scaled.iter().all(|v| (v - expected).abs() < 1e-12));
        Ok(())
    }

    #[test]
    fn single_step_is_deterministic() -> Result<()> {
        let mut scheduler = scheduler();
        scheduler.set_timesteps(1)?;
        let t = scheduler.timesteps()[0];
        let sample = Tensor::new(&[0.5f32, -0.25], &Device::Cpu)?;
        let output = Tensor::new(&[0.1f32, 0.2], &Device::Cpu)?;

        let mut gen_a = Generators::seeded(1);
        let mut gen_b = Generators::seeded(2);
        let a = scheduler.step(
            &output,
            t,
            &sample,
            StepOptions {
                eta: None,
                generator: Some(&mut gen_a),
            },
        )?;
        let b = scheduler.step(
            &output,
            t,
            &sample,
            StepOptions {
                eta: None,
                generator: Some(&mut gen_b),
            },
        )?;
        assert_eq!(a.to_vec1::<f32>()?, b.to_vec1::<f32>()?);

        let (c_skip, c_out) = scheduler.scalings_for_boundary_conditions(80.);
        let expected = (0.1 * c_out + 0.5 * c_skip).clamp(-1., 1.) as f32;
        assert!((a.to_vec1::<f32>()?[0] - expected).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn multistep_renoises_from_generator() -> Result<()> {
        let mut scheduler = scheduler();
        scheduler.set_timesteps(2)?;
        let t = scheduler.timesteps()[0];
        let sample = Tensor::zeros((1, 3, 2, 2), DType::F32, &Device::Cpu)?;
        let output = sample.clone();

        let mut gen = Generators::seeded(5);
        let stepped = scheduler.step(
            &output,
            t,
            &sample,
            StepOptions {
                eta: None,
                generator: Some(&mut gen),
            },
        )?;
        let sigma_next = scheduler.sigmas()[1];
        let scale = (sigma_next.powi(2) - 0.002f64.powi(2)).sqrt();
        let noise = Generator::seed_from_u64(5).randn((1, 3, 2, 2), DType::F32, &Device::Cpu)?;
        let expected = (noise * scale)?.flatten_all()?.to_vec1::<f32>()?;
        let got = stepped.flatten_all()?.to_vec1::<f32>()?;
        for (g, e) in got.iter().zip(expected) {
            assert!((g - e).abs() < 1e-4);
        }
        Ok(())
    }
}
