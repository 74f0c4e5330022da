use std::time::Instant;

use denoise_rs_core::{
    Generators, Img2ImgParams, ModelDType, ModelSource, Pipeline, StableDiffusionVersion,
    TokenSource,
};

use clap::Parser;
use denoise_rs_examples::init_logging;

#[derive(Parser)]
struct Args {
    /// Which model to use
    #[arg(long, value_enum, default_value = "v1-5")]
    which: StableDiffusionVersion,

    /// Prompt to use
    #[arg(short, long)]
    prompt: String,

    /// Source image
    #[arg(short, long)]
    image: String,

    /// How much of the source image is replaced
    #[arg(short, long, default_value_t = 0.75)]
    strength: f64,

    #[arg(long, default_value_t = 0)]
    seed: u64,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging();

    let model_id = match args.which {
        StableDiffusionVersion::V1_5 => "stable-diffusion-v1-5/stable-diffusion-v1-5",
        StableDiffusionVersion::V2_1 => "stabilityai/stable-diffusion-2-1",
    };

    let pipeline = Pipeline::load(
        ModelSource::from_model_id(model_id),
        false,
        TokenSource::CacheToken,
        None,
        &ModelDType::Auto,
    )?;

    let source = image::open(&args.image)?;

    let start = Instant::now();

    let images = pipeline.forward(
        vec![args.prompt],
        &source,
        &Img2ImgParams {
            strength: args.strength,
            num_inference_steps: 50,
            guidance_scale: 7.5,
            ..Default::default()
        },
        &mut Generators::seeded(args.seed),
    )?;

    let end = Instant::now();
    println!("Took: {:.2}s", end.duration_since(start).as_secs_f32());

    images[0].save("image.png")?;

    Ok(())
}
