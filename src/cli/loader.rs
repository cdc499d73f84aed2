use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use super::{args::Args, config::ConfigFile};
use crate::{
    error::NftwallError,
    policy::{ClusterwideNetworkPolicy, Service},
};

/// Resolve the effective configuration from command line arguments and config file
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load(args: &Args) -> Result<ConfigFile, NftwallError> {
        let mut config = match args.config.as_ref() {
            Some(path) => ConfigFile::load(path)?,
            None => ConfigFile::default(),
        };

        if let Some(snapshot) = args.snapshot.as_ref() {
            config.paths.snapshot = snapshot.clone();
        }

        Ok(config)
    }
}

/// Policies and services as handed over by the orchestrator
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Snapshot {
    #[serde(default)]
    pub policies: Vec<ClusterwideNetworkPolicy>,
    #[serde(default)]
    pub services: Vec<Service>,
}

impl Snapshot {
    pub fn load(path: &Path) -> Result<Self, NftwallError> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|source| NftwallError::SnapshotParse {
            path: PathBuf::from(path),
            source,
        })
    }
}
