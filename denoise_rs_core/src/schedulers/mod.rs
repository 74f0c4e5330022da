mod cm_stochastic;
mod ddim;

use denoise_rs_common::{
    core::{Result, Tensor},
    Generators,
};
use serde::Deserialize;
use tracing::warn;

pub use cm_stochastic::{CmStochasticIterativeScheduler, CmStochasticIterativeSchedulerConfig};
pub use ddim::{DdimScheduler, DdimSchedulerConfig};

/// Extra arguments for [`Scheduler::step`]. Pipelines only fill in what the scheduler accepts.
#[derive(Default)]
pub struct StepOptions<'a> {
    pub eta: Option<f64>,
    pub generator: Option<&'a mut Generators>,
}

/// A noise scheduler. Schedulers hold the timestep schedule of the current invocation, so
/// [`Scheduler::set_timesteps`] must be called before anything else.
pub trait Scheduler: Send {
    /// Build a uniform schedule of `num_inference_steps` entries.
    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()>;

    /// Use an explicit, descending list of training timesteps.
    fn set_custom_timesteps(&mut self, _timesteps: &[usize]) -> Result<()> {
        denoise_rs_common::core::bail!("this scheduler does not support custom timesteps")
    }

    fn timesteps(&self) -> &[f64];

    /// Number of schedule entries consumed per denoising step.
    fn order(&self) -> usize {
        1
    }

    fn init_noise_sigma(&self) -> f64;

    /// Whether [`StepOptions::eta`] is used.
    fn accepts_eta(&self) -> bool {
        false
    }

    /// Whether [`StepOptions::generator`] is used.
    fn accepts_generator(&self) -> bool {
        false
    }

    fn scale_model_input(&self, sample: Tensor, timestep: f64) -> Result<Tensor>;

    fn add_noise(&self, original: &Tensor, noise: &Tensor, timestep: f64) -> Result<Tensor>;

    fn step(
        &mut self,
        model_output: &Tensor,
        timestep: f64,
        sample: &Tensor,
        options: StepOptions<'_>,
    ) -> Result<Tensor>;
}

/// How beta evolves during training.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    Linear,
    #[default]
    ScaledLinear,
    #[serde(rename = "squaredcos_cap_v2")]
    SquaredcosCapV2,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    #[default]
    Epsilon,
    VPrediction,
    Sample,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestepSpacing {
    #[default]
    Leading,
    Linspace,
    Trailing,
}

/// A `scheduler_config.json`, dispatched on `_class_name`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "_class_name")]
pub enum SchedulerConfig {
    #[serde(rename = "DDIMScheduler")]
    Ddim(DdimSchedulerConfig),
    #[serde(rename = "CMStochasticIterativeScheduler")]
    CmStochasticIterative(CmStochasticIterativeSchedulerConfig),
}

#[derive(Deserialize)]
struct SchedulerConfigShim {
    #[serde(rename = "_class_name")]
    name: String,
}

impl SchedulerConfig {
    /// Parse a config. Beta-schedule schedulers without a native implementation here fall back to
    /// DDIM with the same betas.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let SchedulerConfigShim { name } = serde_json::from_str(json)?;
        match name.as_str() {
            "DDIMScheduler" | "CMStochasticIterativeScheduler" => Ok(serde_json::from_str(json)?),
            "PNDMScheduler"
            | "DDPMScheduler"
            | "EulerDiscreteScheduler"
            | "EulerAncestralDiscreteScheduler"
            | "LMSDiscreteScheduler"
            | "DPMSolverMultistepScheduler" => {
                warn!("`{name}` is not available, using `DDIMScheduler` with the same betas.");
                Ok(Self::Ddim(serde_json::from_str(json)?))
            }
            other => anyhow::bail!("Unexpected scheduler type `{other:?}`."),
        }
    }

    pub fn build(&self) -> Result<Box<dyn Scheduler>> {
        match self {
            Self::Ddim(cfg) => Ok(Box::new(DdimScheduler::new(cfg.clone())?)),
            Self::CmStochasticIterative(cfg) => {
                Ok(Box::new(CmStochasticIterativeScheduler::new(cfg.clone())))
            }
        }
    }
}

/// `num` evenly spaced values over `[start, stop]`.
pub(crate) fn linspace(start: f64, stop: f64, num: usize) -> Vec<f64> {
    match num {
        0 => vec![],
        1 => vec![start],
        _ => {
            let delta = (stop - start) / (num - 1) as f64;
            (0..num).map(|i| start + delta * i as f64).collect()
        }
    }
}

/// Position of `timestep` in a schedule.
pub(crate) fn index_for_timestep(timesteps: &[f64], timestep: f64) -> Result<usize> {
    timesteps
        .iter()
        .position(|t| (t - timestep).abs() < 1e-6)
        .ok_or_else(|| {
            denoise_rs_common::core::Error::Msg(format!(
                "timestep {timestep} is not part of the current schedule"
            ))
        })
}
