use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use tokio::process::Command;

#[cfg(test)]
use mockall::automock;

use crate::error::NftwallError;

pub const DEFAULT_NFT_BINARY: &str = "nft";

/// Syntax check of a rendered ruleset before it replaces the active one
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RulesetValidator: Send + Sync {
    async fn validate(&self, path: &Path) -> Result<(), NftwallError>;
}

/// Validates rulesets with `nft -c -f <path>`
#[derive(Debug, Clone)]
pub struct NftValidator {
    binary: PathBuf,
}

impl NftValidator {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for NftValidator {
    fn default() -> Self {
        Self::new(DEFAULT_NFT_BINARY)
    }
}

#[async_trait]
impl RulesetValidator for NftValidator {
    async fn validate(&self, path: &Path) -> Result<(), NftwallError> {
        run_nft(&self.binary, &[OsStr::new("-c"), OsStr::new("-f"), path.as_os_str()])
            .await
            .map_err(|err| match err {
                NftwallError::CommandFailed { stderr, .. } => NftwallError::InvalidRuleset {
                    path: path.to_path_buf(),
                    stderr,
                },
                other => other,
            })
    }
}

/// Run `binary` with `args`, mapping a non-zero exit to [`NftwallError::CommandFailed`]
pub(crate) async fn run_nft(binary: &Path, args: &[&OsStr]) -> Result<(), NftwallError> {
    let output = Command::new(binary).args(args).output().await?;
    if output.status.success() {
        return Ok(());
    }

    let command = std::iter::once(binary.as_os_str())
        .chain(args.iter().copied())
        .map(|part| part.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ");
    Err(NftwallError::CommandFailed {
        command,
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}
