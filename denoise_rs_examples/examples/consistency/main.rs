use std::{sync::Arc, time::Instant};

use denoise_rs_core::{
    core::{DType, Device, Result, Tensor},
    schedulers::SchedulerConfig,
    ClassLabels, Conditioning, ConsistencyInputs, ConsistencyModelPipeline, ConsistencyParams,
    DenoisingModel, Generators,
};

use clap::Parser;
use denoise_rs_examples::init_logging;

const SCHEDULER_CONFIG: &str = r#"{
    "_class_name": "CMStochasticIterativeScheduler",
    "num_train_timesteps": 40,
    "sigma_min": 0.002,
    "sigma_max": 80.0,
    "sigma_data": 0.5,
    "s_noise": 1.0,
    "rho": 7.0,
    "clip_denoised": true
}"#;

/// Maps every noisy sample to a flat image tinted by its class. Stands in for a trained
/// class-conditional consistency UNet.
struct TintModel {
    device: Device,
}

impl TintModel {
    fn tint(label: u32, channel: u32) -> f32 {
        let v = (label.wrapping_mul(channel + 1).wrapping_mul(37)) % 256;
        v as f32 / 127.5 - 1.
    }
}

impl DenoisingModel for TintModel {
    fn predict(&self, sample: &Tensor, _timestep: f64, conditioning: &Conditioning) -> Result<Tensor> {
        let (b, c, h, w) = sample.dims4()?;
        let labels = match &conditioning.class_labels {
            Some(labels) => labels.to_vec1::<u32>()?,
            None => vec![0; b],
        };
        let rows = labels
            .iter()
            .map(|label| {
                let tints = (0..c as u32).map(|ch| Self::tint(*label, ch)).collect::<Vec<_>>();
                Tensor::from_vec(tints, (1, c, 1, 1), &self.device)?.broadcast_as((1, c, h, w))
            })
            .collect::<Result<Vec<_>>>()?;
        // Keep a trace of the input so later steps still depend on the sample.
        let tinted = Tensor::cat(&rows, 0)?;
        tinted + (sample * 0.01)?
    }

    fn in_channels(&self) -> usize {
        3
    }

    fn sample_size(&self) -> usize {
        64
    }

    fn num_class_embeds(&self) -> Option<usize> {
        Some(1000)
    }

    fn dtype(&self) -> DType {
        DType::F32
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

#[derive(Parser)]
struct Args {
    /// ImageNet class of every sample. Random classes are drawn when unset.
    #[arg(short, long)]
    class: Option<u32>,

    #[arg(short, long, default_value_t = 4)]
    batch_size: usize,

    /// Explicit timesteps, e.g. `22,0` for two-step sampling.
    #[arg(short, long, value_delimiter = ',')]
    timesteps: Option<Vec<usize>>,

    #[arg(long, default_value_t = 0)]
    seed: u64,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging();

    let scheduler = SchedulerConfig::from_json(SCHEDULER_CONFIG)?.build()?;
    let mut pipeline = ConsistencyModelPipeline::new(
        Arc::new(TintModel {
            device: Device::Cpu,
        }),
        scheduler,
    );

    let inputs = ConsistencyInputs {
        class_labels: args
            .class
            .map(|class| ClassLabels::Batch(vec![class; args.batch_size])),
        latents: None,
    };
    let params = ConsistencyParams {
        batch_size: args.batch_size,
        timesteps: args.timesteps,
        ..Default::default()
    };

    let start = Instant::now();

    let images = pipeline
        .generate(&inputs, &params, &mut Generators::seeded(args.seed))?
        .images
        .into_images()?;

    let end = Instant::now();
    println!("Took: {:.2}s", end.duration_since(start).as_secs_f32());

    for (i, image) in images.iter().enumerate() {
        image.save(format!("sample_{i}.png"))?;
    }

    Ok(())
}
