pub mod file;
pub mod settings;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use url::Url;

pub use self::{file::File, settings::Settings};

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Data {
    pub dir: PathBuf,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Esplora {
    pub base_url: Url,
}

pub fn read_config<T>(config_file: &Option<PathBuf>, default_config_path: T) -> anyhow::Result<File>
where
    T: FnOnce() -> anyhow::Result<PathBuf>,
{
    let path = config_file
        .as_ref()
        .map(|path| {
            eprintln!("Using config file {}", path.display());
            path
        })
        .map_or_else(
            || {
                // try to load default config
                let default_path = default_config_path()?;

                if default_path.exists() {
                    eprintln!(
                        "Using config file at default path: {}",
                        default_path.display()
                    );
                    Ok(default_path)
                } else {
                    eprintln!("Config file default path is {}", default_path.display());
                    Err(anyhow!("internal error (unreachable)"))
                }
            },
            |path| Ok(path.to_path_buf()),
        )
        .ok();

    match path {
        Some(path) => File::read(&path)
            .with_context(|| format!("failed to read config file {}", path.display())),
        None => Ok(File::default()),
    }
}
