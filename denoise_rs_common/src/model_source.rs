use std::{
    ffi::OsStr,
    fmt::{Debug, Display},
    fs,
    path::{Path, PathBuf},
};

use crate::{get_token, TokenSource};
use hf_hub::{
    api::sync::{ApiBuilder, ApiRepo},
    Repo, RepoType,
};

/// Source from which to load the model. This is easiest to create with the various constructor functions.
#[derive(Debug, Clone)]
pub enum ModelSource {
    ModelId(String),
    LocalDir(PathBuf),
}

impl Display for ModelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ModelId(model_id) => write!(f, "model id: {model_id}"),
            Self::LocalDir(dir) => write!(f, "local dir: {}", dir.display()),
        }
    }
}

impl ModelSource {
    /// Load the model from a Hugging Face model ID or a local path. Existing directories are read directly.
    pub fn from_model_id<S: ToString>(model_id: S) -> Self {
        let model_id = model_id.to_string();
        if Path::new(&model_id).is_dir() {
            Self::LocalDir(PathBuf::from(model_id))
        } else {
            Self::ModelId(model_id)
        }
    }
}

pub enum FileLoader {
    Api(Box<ApiRepo>),
    Local(PathBuf),
}

impl FileLoader {
    pub fn from_model_source(
        source: &ModelSource,
        silent: bool,
        token: TokenSource,
        revision: Option<String>,
    ) -> anyhow::Result<Self> {
        match source {
            ModelSource::ModelId(model_id) => {
                let api_builder = ApiBuilder::new()
                    .with_progress(!silent)
                    .with_token(get_token(&token)?)
                    .build()?;
                let revision = revision.unwrap_or("main".to_string());
                let api = api_builder.repo(Repo::with_revision(
                    model_id.clone(),
                    RepoType::Model,
                    revision,
                ));

                Ok(Self::Api(Box::new(api)))
            }
            ModelSource::LocalDir(dir) => Ok(Self::Local(dir.clone())),
        }
    }

    /// List all files, with paths relative to the model root using `/` separators.
    pub fn list_files(&self) -> anyhow::Result<Vec<String>> {
        match self {
            Self::Api(api) => api
                .info()
                .map(|repo| {
                    repo.siblings
                        .iter()
                        .map(|x| x.rfilename.clone())
                        .collect::<Vec<String>>()
                })
                .map_err(|e| anyhow::Error::msg(e.to_string())),
            Self::Local(root) => {
                let mut files = Vec::new();
                collect_files(root, root, &mut files)?;
                files.sort();
                Ok(files)
            }
        }
    }

    /// Resolve a file to a local path, downloading it first for hub sources.
    pub fn read_file(&self, name: &str) -> anyhow::Result<FileData> {
        match self {
            Self::Api(api) => Ok(FileData(
                api.get(name)
                    .map_err(|e| anyhow::Error::msg(e.to_string()))?,
            )),
            Self::Local(root) => {
                let path = root.join(name);
                if !path.is_file() {
                    anyhow::bail!("file `{name}` not found in {}", root.display());
                }
                Ok(FileData(path))
            }
        }
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> anyhow::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push(rel);
        }
    }
    Ok(())
}

/// A resolved file on the local filesystem.
pub struct FileData(PathBuf);

impl Debug for FileData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "path: {}", self.0.display())
    }
}

impl FileData {
    pub fn path(&self) -> &Path {
        &self.0
    }

    pub fn read_to_string(&self) -> anyhow::Result<String> {
        Ok(fs::read_to_string(&self.0)?)
    }

    pub fn extension(&self) -> Option<&OsStr> {
        self.0.extension()
    }
}
