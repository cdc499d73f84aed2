use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Compile network policies into an nftables ruleset with FQDN-aware DNS proxying"
)]
pub struct Args {
    /// Path to configuration file (TOML)
    #[arg(long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Path to the policy and service snapshot (TOML), overrides the config file
    #[arg(long = "snapshot", value_name = "PATH")]
    pub snapshot: Option<PathBuf>,

    /// Run a single reconcile cycle and exit
    #[arg(long = "once")]
    pub once: bool,

    /// Print the rendered ruleset instead of writing and applying it
    #[arg(long = "dry-run")]
    pub dry_run: bool,
}
