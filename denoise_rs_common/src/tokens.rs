use std::{fs, path::PathBuf};

use anyhow::Result;
use thiserror::Error;
use tracing::warn;

/// Where the Hugging Face token for gated repositories comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenSource {
    Literal(String),
    /// `~/.cache/huggingface/token`, as written by `huggingface-cli login`.
    CacheToken,
    None,
}

#[derive(Error, Debug)]
#[error("cannot locate the Hugging Face token cache without a home directory")]
struct NoHomeDir;

fn cached_token_path() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or(NoHomeDir)?;
    Ok(home.join(".cache").join("huggingface").join("token"))
}

/// Resolve the token. A missing cache file is not an error: a warning is logged and the hub is
/// queried anonymously.
pub fn get_token(source: &TokenSource) -> Result<Option<String>> {
    let token = match source {
        TokenSource::Literal(token) => Some(token.clone()),
        TokenSource::CacheToken => {
            let path = cached_token_path()?;
            match fs::read_to_string(&path) {
                Ok(token) => Some(token),
                Err(e) => {
                    warn!("no Hugging Face token at {} ({e}), continuing without one", path.display());
                    None
                }
            }
        }
        TokenSource::None => None,
    };
    Ok(token
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty()))
}
