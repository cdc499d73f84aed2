use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
};

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::{
    error::NftwallError,
    render::validate::{DEFAULT_NFT_BINARY, run_nft},
};

/// Loads a validated ruleset into the kernel
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RulesetApplier: Send + Sync {
    async fn apply(&self, path: &Path) -> Result<(), NftwallError>;
}

/// Applies rulesets with `nft -f <path>`
#[derive(Debug, Clone)]
pub struct NftApplier {
    binary: PathBuf,
}

impl NftApplier {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for NftApplier {
    fn default() -> Self {
        Self::new(DEFAULT_NFT_BINARY)
    }
}

#[async_trait]
impl RulesetApplier for NftApplier {
    async fn apply(&self, path: &Path) -> Result<(), NftwallError> {
        run_nft(&self.binary, &[OsStr::new("-f"), path.as_os_str()]).await?;
        log::info!("Applied ruleset {}", path.display());
        Ok(())
    }
}
