#![allow(dead_code)]

use std::{
    io::Write,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use denoise_rs_core::{
    core::{DType, Device, Result, Tensor},
    schedulers::{Scheduler, StepOptions},
    Conditioning, DenoisingModel, DiagonalGaussian, LatentDistribution, SafetyChecker,
    TextEncoder, Vae,
};
use tracing::Dispatch;

/// Predicts a tenth of its input and records the batch of every call.
pub struct AnalyticModel {
    pub in_channels: usize,
    pub num_class_embeds: Option<usize>,
    pub batches: Mutex<Vec<usize>>,
    pub labels: Mutex<Vec<Vec<u32>>>,
    device: Device,
}

impl AnalyticModel {
    pub fn new(in_channels: usize) -> Self {
        Self {
            in_channels,
            num_class_embeds: None,
            batches: Mutex::new(Vec::new()),
            labels: Mutex::new(Vec::new()),
            device: Device::Cpu,
        }
    }

    pub fn with_classes(mut self, num_class_embeds: usize) -> Self {
        self.num_class_embeds = Some(num_class_embeds);
        self
    }

    pub fn calls(&self) -> usize {
        self.batches.lock().map(|b| b.len()).unwrap_or_default()
    }
}

impl DenoisingModel for AnalyticModel {
    fn predict(&self, sample: &Tensor, _timestep: f64, conditioning: &Conditioning) -> Result<Tensor> {
        if let Ok(mut batches) = self.batches.lock() {
            batches.push(sample.dim(0)?);
        }
        if let Some(labels) = &conditioning.class_labels {
            if let Ok(mut seen) = self.labels.lock() {
                seen.push(labels.to_vec1::<u32>()?);
            }
        }
        sample.affine(0.1, 0.)
    }

    fn in_channels(&self) -> usize {
        self.in_channels
    }

    fn sample_size(&self) -> usize {
        8
    }

    fn num_class_embeds(&self) -> Option<usize> {
        self.num_class_embeds
    }

    fn dtype(&self) -> DType {
        DType::F32
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

/// Encodes an image as itself plus its channel mean, with no variance. Decoding drops the
/// extra channel.
pub struct IdentityVae;

impl Vae for IdentityVae {
    fn encode(&self, images: &Tensor) -> Result<Box<dyn LatentDistribution>> {
        let mean = Tensor::cat(&[images, &images.mean_keepdim(1)?], 1)?;
        let std = mean.zeros_like()?;
        Ok(Box::new(DiagonalGaussian::new(mean, std)))
    }

    fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        latents.narrow(1, 0, 3)
    }

    fn scaling_factor(&self) -> f64 {
        1.
    }
}

/// Embeds each prompt as a constant equal to its length, counting calls.
#[derive(Default)]
pub struct ConstantEncoder {
    pub calls: AtomicUsize,
}

impl ConstantEncoder {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TextEncoder for ConstantEncoder {
    fn encode(&self, prompts: &[String]) -> Result<Tensor> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let rows = prompts
            .iter()
            .map(|p| Tensor::full(p.len() as f32, (1, 2, 4), &Device::Cpu))
            .collect::<Result<Vec<_>>>()?;
        Tensor::cat(&rows, 0)
    }
}

/// A second order scheduler: every denoising step spans two schedule entries.
#[derive(Default)]
pub struct PairedScheduler {
    timesteps: Vec<f64>,
}

impl Scheduler for PairedScheduler {
    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        self.timesteps = (0..num_inference_steps)
            .rev()
            .flat_map(|i| [i as f64 * 10. + 5., i as f64 * 10.])
            .collect();
        Ok(())
    }

    fn timesteps(&self) -> &[f64] {
        &self.timesteps
    }

    fn order(&self) -> usize {
        2
    }

    fn init_noise_sigma(&self) -> f64 {
        1.
    }

    fn scale_model_input(&self, sample: Tensor, _timestep: f64) -> Result<Tensor> {
        Ok(sample)
    }

    fn add_noise(&self, original: &Tensor, noise: &Tensor, _timestep: f64) -> Result<Tensor> {
        original + (noise * 0.1)?
    }

    fn step(
        &mut self,
        model_output: &Tensor,
        _timestep: f64,
        sample: &Tensor,
        _options: StepOptions<'_>,
    ) -> Result<Tensor> {
        sample - (model_output * 0.5)?
    }
}

/// Flags the images whose index is listed, leaving the pixels untouched.
pub struct FlagChecker {
    pub flagged: Vec<usize>,
}

impl SafetyChecker for FlagChecker {
    fn check(&self, images: &Tensor) -> Result<(Tensor, Vec<bool>)> {
        let flags = (0..images.dim(0)?)
            .map(|i| self.flagged.contains(&i))
            .collect();
        Ok((images.clone(), flags))
    }
}

#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.0.lock() {
            Ok(mut inner) => inner.write(buf),
            Err(_) => Ok(0),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SharedBuffer {
    pub fn contents(&self) -> String {
        self.0
            .lock()
            .map(|inner| String::from_utf8_lossy(&inner).into_owned())
            .unwrap_or_default()
    }
}

/// A log sink writing plain text into the returned buffer.
pub fn capture_logs() -> (Dispatch, SharedBuffer) {
    let buffer = SharedBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    (Dispatch::new(subscriber), buffer)
}

pub fn to_vec(t: &Tensor) -> Result<Vec<f32>> {
    t.flatten_all()?.to_vec1::<f32>()
}
