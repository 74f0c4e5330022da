use cliclack::input;
use std::{path::PathBuf, time::Instant};

use clap::Parser;
use denoise_rs_core::{Generators, Img2ImgParams, ModelDType, ModelSource, Pipeline, TokenSource};
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

const GUIDANCE_SCALE_DEFAULT: f64 = 7.5;

#[derive(Parser)]
struct Args {
    /// Model ID: a local path or a Hugging Face model ID.
    #[arg(short, long, default_value = "stable-diffusion-v1-5/stable-diffusion-v1-5")]
    model_id: String,

    /// Hugging Face token. Useful for accessing gated repositories.
    /// By default, the Hugging Face token at ~/.cache/huggingface/token is used.
    #[arg(long)]
    token: Option<String>,

    /// Source image to transform.
    #[arg(short, long)]
    image: PathBuf,

    /// How much of the source image is replaced, in [0, 1].
    #[arg(long, default_value_t = 0.8)]
    strength: f64,

    /// Guidance scale to use. Guidance is disabled at 1.0 or below. If not specified, defaults to 7.5.
    #[arg(short, long)]
    scale: Option<f64>,

    /// Number of denoising steps for strength 1.0. Fewer are run for lower strengths.
    #[arg(short, long, default_value_t = 50)]
    num_steps: usize,

    /// Model precision.
    #[arg(long, value_enum, default_value_t = ModelDType::Auto)]
    dtype: ModelDType,

    /// Seed of the first generation. Later prompts use the following seeds.
    #[arg(long)]
    seed: Option<u64>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let token = args
        .token
        .map(TokenSource::Literal)
        .unwrap_or(TokenSource::CacheToken);

    let pipeline = Pipeline::load(
        ModelSource::from_model_id(args.model_id),
        false,
        token,
        None,
        &args.dtype,
    )?;
    let source = image::open(&args.image)?;
    info!(
        "loaded source image {} ({}x{})",
        args.image.display(),
        source.width(),
        source.height()
    );

    let params = Img2ImgParams {
        strength: args.strength,
        num_inference_steps: args.num_steps,
        guidance_scale: args.scale.unwrap_or(GUIDANCE_SCALE_DEFAULT),
        ..Default::default()
    };

    let mut seed = args.seed;
    loop {
        let prompt: String = input("Prompt:")
            .validate(|input: &String| {
                if input.is_empty() {
                    Err("Prompt is required!")
                } else {
                    Ok(())
                }
            })
            .interact()?;

        let mut generator = match seed {
            Some(s) => {
                seed = Some(s.wrapping_add(1));
                Generators::seeded(s)
            }
            None => Generators::default(),
        };

        let start = Instant::now();

        let images = pipeline.forward(vec![prompt], &source, &params, &mut generator)?;

        let end = Instant::now();
        println!(
            "Image generation took: {:.2}s",
            end.duration_since(start).as_secs_f32()
        );

        let out_file: String = input("Save image to:")
            .validate(|input: &String| {
                if input.is_empty() {
                    Err("Image path is required!")
                } else {
                    let path = PathBuf::from(input);
                    let ext = path.extension().ok_or("Extension is required!")?;
                    if !ext.to_str().is_some_and(|ext| ["png", "jpg"].contains(&ext)) {
                        Err(".png or .jpg extension is required!")
                    } else {
                        Ok(())
                    }
                }
            })
            .interact()?;

        images[0].save(out_file)?;
    }
}
