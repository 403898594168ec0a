//! fetchmux: checkpointed log fetcher runtime binary.
//!
//! `run` drives every configured source in-process; `checkpoints` and
//! `probe` are operator tools.

use clap::Parser;

mod checkpoints;
mod cli;
mod config;
mod daemon;
mod json_source;
mod probe;
mod registry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();

    let filter = std::env::var("FETCHMUX_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        cli::Command::Run(opts) => {
            let config = config::Config::load(&opts.config)?;
            if opts.check {
                let registry = registry::SourceRegistry::with_builtin();
                for source in &config.sources {
                    registry.build(source)?;
                }
                println!(
                    "{}: ok ({} sources)",
                    opts.config.display(),
                    config.sources.len()
                );
                return Ok(());
            }
            daemon::run(config).await?;
        }
        cli::Command::Checkpoints(opts) => {
            checkpoints::cmd_checkpoints(&opts).await?;
        }
        cli::Command::Probe(opts) => {
            probe::cmd_probe(opts).await?;
        }
    }

    Ok(())
}
