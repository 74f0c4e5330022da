use denoise_rs_common::core::{bail, Result, Tensor};

/// Classifier-free guidance only runs for scales strictly above 1.
pub fn do_classifier_free_guidance(guidance_scale: f64) -> bool {
    guidance_scale > 1.0
}

/// Stack the latents twice along the batch so one model call yields both predictions.
pub fn expand_for_guidance(latents: &Tensor) -> Result<Tensor> {
    Tensor::cat(&[latents, latents], 0)
}

/// Split a doubled prediction into its unconditional and conditional halves and extrapolate:
/// `uncond + scale * (cond - uncond)`.
pub fn apply_guidance(noise_pred: &Tensor, guidance_scale: f64) -> Result<Tensor> {
    let batch = noise_pred.dim(0)?;
    if batch % 2 != 0 {
        bail!("guided prediction must have an even batch, got {batch}");
    }
    let uncond = noise_pred.narrow(0, 0, batch / 2)?;
    let cond = noise_pred.narrow(0, batch / 2, batch / 2)?;
    &uncond + ((&cond - &uncond)? * guidance_scale)?
}

#[cfg(test)]
mod tests {
    use denoise_rs_common::core::Device;

    use super::*;

    #[test]
    fn guidance_threshold_is_strict() {
        assert!(!do_classifier_free_guidance(1.0));
        assert!(!do_classifier_free_guidance(0.5));
        assert!(do_classifier_free_guidance(1.0001));
        assert!(do_classifier_free_guidance(7.5));
    }

    #[test]
    fn expansion_duplicates_the_batch() -> Result<()> {
        let latents = Tensor::new(&[[1f32, 2.], [3., 4.]], &Device::Cpu)?;
        let expanded = expand_for_guidance(&latents)?;
        assert_eq!(
            expanded.to_vec2::<f32>()?,
            vec![vec![1., 2.], vec![3., 4.], vec![1., 2.], vec![3., 4.]]
        );
        Ok(())
    }

    #[test]
    fn guidance_is_a_linear_extrapolation() -> Result<()> {
        let uncond = [0.5f64, -1.0, 2.0];
        let cond = [1.0f64, 0.25, -3.0];
        let pred = Tensor::new(&[uncond, cond], &Device::Cpu)?;
        for scale in [1.0, 2.0, 7.5] {
            let guided = apply_guidance(&pred, scale)?.to_vec2::<f64>()?;
            let expected = uncond
                .iter()
                .zip(cond)
                .map(|(u, c)| u + scale * (c - u))
                .collect::<Vec<_>>();
            assert_eq!(guided[0], expected);
        }
        // A scale of 1 gives back the conditional prediction.
        assert_eq!(apply_guidance(&pred, 1.0)?.to_vec2::<f64>()?[0], cond.to_vec());
        Ok(())
    }

    #[test]
    fn odd_batches_are_rejected() -> Result<()> {
        let pred = Tensor::zeros((3, 2), denoise_rs_common::core::DType::F32, &Device::Cpu)?;
        assert!(apply_guidance(&pred, 2.0).is_err());
        Ok(())
    }
}
