//! modelrelay entry point.
//!
//! Logging: set `RUST_LOG=modelrelay=info` (or `warn`, `debug`) to control
//! gateway logs on stderr.

mod cli;

use std::path::Path;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use modelrelay::app::Gateway;
use modelrelay::config::Settings;
use modelrelay::presets::PresetCatalog;

use crate::cli::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let verbose = matches!(cli.command, Command::Serve { verbose: true, .. });
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose {
            "modelrelay=debug"
        } else {
            "modelrelay=info"
        })
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    match cli.command {
        Command::Serve {
            bind,
            redis_url,
            presets_dir,
            verbose: _,
        } => {
            let mut settings = Settings::from_env();
            if let Some(bind) = bind {
                if let Some((host, port)) = bind.rsplit_once(':') {
                    settings.server_host = host.to_string();
                    settings.server_port = port
                        .parse()
                        .map_err(|_| anyhow::anyhow!("invalid port in --bind: {bind}"))?;
                }
            }
            if let Some(redis_url) = redis_url {
                settings.redis_url = redis_url;
            }
            if let Some(presets_dir) = presets_dir {
                settings.presets_dir = presets_dir;
            }
            let gateway = Gateway::bootstrap(settings).await?;
            gateway.run().await
        }
        Command::Presets { presets_dir } => {
            let settings = Settings::from_env();
            let dir = presets_dir.unwrap_or(settings.presets_dir);
            let catalog = PresetCatalog::load_dir(Path::new(&dir))?;
            for name in catalog.names() {
                println!("{name}");
            }
            Ok(())
        }
    }
}
