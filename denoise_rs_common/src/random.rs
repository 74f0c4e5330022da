use candle_core::{DType, Device, Result, Shape, Tensor};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use thiserror::Error;
use tracing::info;

/// A seedable random state. Two generators created from the same seed produce identical tensors
/// regardless of the target device, as sampling always happens on the host.
#[derive(Debug, Clone)]
pub struct Generator {
    seed: u64,
    rng: StdRng,
}

impl Generator {
    pub fn seed_from_u64(seed: u64) -> Self {
        Self {
            seed,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Seed from system entropy. The chosen seed is logged so a run can be reproduced.
    pub fn from_entropy() -> Self {
        let seed = rand::thread_rng().gen::<u64>();
        info!("using seed {seed}");
        Self::seed_from_u64(seed)
    }

    pub fn initial_seed(&self) -> u64 {
        self.seed
    }

    /// Sample a standard normal tensor.
    pub fn randn<S: Into<Shape>>(&mut self, shape: S, dtype: DType, device: &Device) -> Result<Tensor> {
        let shape = shape.into();
        let data = (0..shape.elem_count())
            .map(|_| self.rng.sample::<f32, _>(StandardNormal))
            .collect::<Vec<_>>();
        Tensor::from_vec(data, shape, &Device::Cpu)?
            .to_dtype(dtype)?
            .to_device(device)
    }

    /// Sample `n` integers uniformly from `[0, high)`.
    pub fn randint(&mut self, high: u32, n: usize) -> Vec<u32> {
        (0..n).map(|_| self.rng.gen_range(0..high)).collect()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GeneratorError {
    #[error("You have passed a list of generators of length {got}, but requested an effective batch size of {expected}. Make sure the batch size matches the length of the generators.")]
    LengthMismatch { got: usize, expected: usize },
}

/// One generator for the whole batch, or one per batch element.
#[derive(Debug, Clone)]
pub enum Generators {
    Single(Generator),
    PerSample(Vec<Generator>),
}

impl Default for Generators {
    fn default() -> Self {
        Self::Single(Generator::from_entropy())
    }
}

impl Generators {
    pub fn seeded(seed: u64) -> Self {
        Self::Single(Generator::seed_from_u64(seed))
    }

    pub fn per_sample(seeds: impl IntoIterator<Item = u64>) -> Self {
        Self::PerSample(seeds.into_iter().map(Generator::seed_from_u64).collect())
    }

    /// Ensure a per-sample list matches the effective batch size.
    pub fn check_batch(&self, batch_size: usize) -> std::result::Result<(), GeneratorError> {
        match self {
            Self::PerSample(gens) if gens.len() != batch_size => Err(GeneratorError::LengthMismatch {
                got: gens.len(),
                expected: batch_size,
            }),
            _ => Ok(()),
        }
    }

    /// The generator used for batch element `i`.
    pub fn for_sample(&mut self, i: usize) -> Result<&mut Generator> {
        match self {
            Self::Single(gen) => Ok(gen),
            Self::PerSample(gens) => {
                let n = gens.len();
                gens.get_mut(i).ok_or_else(|| {
                    candle_core::Error::Msg(format!("no generator for sample {i}, only {n} given"))
                })
            }
        }
    }

    /// Sample one integer in `[0, high)` per batch element.
    pub fn randint(&mut self, high: u32, batch: usize) -> Result<Vec<u32>> {
        if high == 0 {
            candle_core::bail!("cannot sample integers from an empty range");
        }
        match self {
            Self::Single(gen) => Ok(gen.randint(high, batch)),
            Self::PerSample(gens) => {
                if batch != gens.len() {
                    return Err(candle_core::Error::wrap(GeneratorError::LengthMismatch {
                        got: gens.len(),
                        expected: batch,
                    }));
                }
                Ok(gens.iter_mut().flat_map(|gen| gen.randint(high, 1)).collect())
            }
        }
    }

    /// Sample a standard normal tensor whose leading dimension is the batch. With per-sample
    /// generators, row `i` is drawn from generator `i`.
    pub fn randn<S: Into<Shape>>(&mut self, shape: S, dtype: DType, device: &Device) -> Result<Tensor> {
        let shape = shape.into();
        match self {
            Self::Single(gen) => gen.randn(shape, dtype, device),
            Self::PerSample(gens) => {
                let mut dims = shape.dims().to_vec();
                let Some(batch) = dims.first().copied() else {
                    candle_core::bail!("cannot sample a scalar with per-sample generators")
                };
                if batch != gens.len() {
                    return Err(candle_core::Error::wrap(GeneratorError::LengthMismatch {
                        got: gens.len(),
                        expected: batch,
                    }));
                }
                dims[0] = 1;
                let rows = gens
                    .iter_mut()
                    .map(|gen| gen.randn(dims.as_slice(), dtype, device))
                    .collect::<Result<Vec<_>>>()?;
                Tensor::cat(&rows, 0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_tensor() -> Result<()> {
        let a = Generator::seed_from_u64(42).randn((2, 3), DType::F32, &Device::Cpu)?;
        let b = Generator::seed_from_u64(42).randn((2, 3), DType::F32, &Device::Cpu)?;
        assert_eq!(a.to_vec2::<f32>()?, b.to_vec2::<f32>()?);
        Ok(())
    }

    #[test]
    fn per_sample_rows_follow_their_generator() -> Result<()> {
        let mut gens = Generators::per_sample([1, 2]);
        let batch = gens.randn((2, 4), DType::F32, &Device::Cpu)?.to_vec2::<f32>()?;
        let row0 = Generator::seed_from_u64(1).randn((1, 4), DType::F32, &Device::Cpu)?;
        let row1 = Generator::seed_from_u64(2).randn((1, 4), DType::F32, &Device::Cpu)?;
        assert_eq!(batch[0], row0.to_vec2::<f32>()?[0]);
        assert_eq!(batch[1], row1.to_vec2::<f32>()?[0]);
        Ok(())
    }

    #[test]
    fn randint_stays_in_range() -> Result<()> {
        let labels = Generators::seeded(9).randint(10, 64)?;
        assert_eq!(labels.len(), 64);
        assert!(labels.iter().all(|l| *l < 10));
        assert!(Generators::per_sample([1, 2]).randint(10, 3).is_err());
        Ok(())
    }

    #[test]
    fn length_mismatch_is_reported() {
        let gens = Generators::per_sample([1, 2, 3]);
        assert_eq!(
            gens.check_batch(2),
            Err(GeneratorError::LengthMismatch {
                got: 3,
                expected: 2
            })
        );
        assert!(Generators::seeded(0).check_batch(7).is_ok());
    }
}
