use clap::Parser;
use nftwall::{
    cli::{Args, ConfigLoader},
    error::NftwallError,
    runtime::{build_cache, build_reconciler, run},
};

#[tokio::main]
async fn main() -> Result<(), NftwallError> {
    env_logger::init();

    let args = Args::parse();
    let config = ConfigLoader::load(&args)?;

    if args.dry_run {
        let cache = build_cache(&config)?;
        let (text, compiled) = build_reconciler(&config, cache)?.render_once()?;
        for rejected in &compiled.rejected {
            eprintln!(
                "rejected {} of {}: {}",
                rejected.rule, rejected.object, rejected.reason
            );
        }
        print!("{text}");
        return Ok(());
    }

    if args.once {
        let cache = build_cache(&config)?;
        let outcome = build_reconciler(&config, cache)?.reconcile_once().await?;
        log::info!(
            "Reconcile finished (changed: {}, rejected rules: {})",
            outcome.changed,
            outcome.rejected
        );
        return Ok(());
    }

    run(&config).await
}
