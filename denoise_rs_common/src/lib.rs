#[cfg(feature = "accelerate")]
extern crate accelerate_src;
#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

mod model_source;
mod progress;
mod random;
mod tokens;

pub use candle_core as core;

pub use model_source::*;
pub use progress::{manual_progress_bar, NiceProgressBar};
pub use random::{Generator, GeneratorError, Generators};
pub use tokens::get_token;
pub use tokens::TokenSource;
