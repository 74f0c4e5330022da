use std::fmt::Display;

use anyhow::Result;
use denoise_rs_common::core::{DType, Device, Tensor};
use serde::Deserialize;
use tracing::info;

#[derive(Clone, Copy, Default, Debug, Deserialize, PartialEq, clap::ValueEnum)]
/// DType for the model weights and latents.
///
/// Note: When using `Auto`, fallback pattern is: BF16 -> F16 -> F32
pub enum ModelDType {
    #[default]
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "bf16")]
    BF16,
    #[serde(rename = "f16")]
    F16,
    #[serde(rename = "f32")]
    F32,
}

impl Display for ModelDType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::BF16 => write!(f, "bf16"),
            Self::F16 => write!(f, "f16"),
            Self::F32 => write!(f, "f32"),
        }
    }
}

/// Type which can be converted to a DType
pub trait TryIntoDType {
    fn try_into_dtype(&self, devices: &[&Device], silent: bool) -> Result<DType>;
}

impl TryIntoDType for DType {
    fn try_into_dtype(&self, _: &[&Device], silent: bool) -> Result<DType> {
        if !silent {
            info!("dtype selected is {self:?}.");
        }
        if !matches!(self, DType::BF16 | DType::F32 | DType::F64 | DType::F16) {
            anyhow::bail!("DType must be one of BF16, F16, F32, F64");
        }
        Ok(*self)
    }
}

#[cfg(feature = "cuda")]
fn get_dtypes(silent: bool) -> Vec<DType> {
    use std::process::Command;

    // >= is supported
    const MIN_BF16_CC: usize = 800;
    // >= is supported
    const MIN_F16_CC: usize = 530;

    let out = match Command::new("nvidia-smi")
        .arg("--query-gpu=compute_cap")
        .arg("--format=csv")
        .output()
    {
        Ok(out) => String::from_utf8_lossy(&out.stdout).to_string(),
        Err(e) => {
            tracing::warn!("could not run `nvidia-smi` ({e}), using half precision candidates as-is");
            return get_dtypes_non_cuda();
        }
    };
    let Some(min_cc) = out
        .split('\n')
        .skip(1)
        .filter_map(|cc| cc.trim().parse::<f32>().ok())
        .reduce(f32::min)
    else {
        tracing::warn!("`nvidia-smi` reported no compute capability");
        return Vec::new();
    };
    if !silent {
        info!("detected minimum CUDA compute capability {min_cc}");
    }
    // 7.5 -> 750
    #[allow(clippy::cast_possible_truncation)]
    let min_cc = (min_cc * 100.) as usize;

    let mut dtypes = Vec::new();
    if min_cc >= MIN_BF16_CC {
        dtypes.push(DType::BF16);
    } else if !silent {
        info!("skipping BF16 because CC < 8.0");
    }
    if min_cc >= MIN_F16_CC {
        dtypes.push(DType::F16);
    } else if !silent {
        info!("skipping F16 because CC < 5.3");
    }
    dtypes
}

fn get_dtypes_non_cuda() -> Vec<DType> {
    vec![DType::BF16, DType::F16]
}

#[cfg(not(feature = "cuda"))]
fn get_dtypes(_silent: bool) -> Vec<DType> {
    get_dtypes_non_cuda()
}

/// Pick the first half precision dtype that every device can run a matmul in.
fn determine_auto_dtype_all(devices: &[&Device], silent: bool) -> DType {
    let dev_dtypes = get_dtypes(silent);
    for dtype in get_dtypes_non_cuda()
        .into_iter()
        .filter(|x| dev_dtypes.contains(x))
    {
        let supported = devices.iter().all(|device| {
            Tensor::zeros((2, 2), dtype, device)
                .and_then(|x| x.matmul(&x))
                .is_ok()
        });
        if supported {
            return dtype;
        }
    }
    DType::F32
}

impl TryIntoDType for ModelDType {
    fn try_into_dtype(&self, devices: &[&Device], silent: bool) -> Result<DType> {
        let dtype = match self {
            Self::Auto => determine_auto_dtype_all(devices, silent),
            Self::BF16 => DType::BF16,
            Self::F16 => DType::F16,
            Self::F32 => DType::F32,
        };
        if !silent {
            info!("dtype selected is {dtype:?}.");
        }
        Ok(dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_dtypes_are_kept() -> Result<()> {
        let cpu = Device::Cpu;
        assert_eq!(ModelDType::F32.try_into_dtype(&[&cpu], true)?, DType::F32);
        assert_eq!(ModelDType::BF16.try_into_dtype(&[&cpu], true)?, DType::BF16);
        assert!(DType::U8.try_into_dtype(&[&cpu], true).is_err());
        Ok(())
    }

    #[test]
    fn auto_picks_a_float_dtype() -> Result<()> {
        let cpu = Device::Cpu;
        let dtype = ModelDType::Auto.try_into_dtype(&[&cpu], true)?;
        assert!(matches!(dtype, DType::BF16 | DType::F16 | DType::F32));
        Ok(())
    }

    #[test]
    fn display_matches_cli_names() {
        assert_eq!(ModelDType::Auto.to_string(), "auto");
        assert_eq!(ModelDType::F16.to_string(), "f16");
    }
}
