use anyhow::Context;
use chrono::Utc;
use nightwatch_coordinator::{Coordinator, CoordinatorServer};
use nightwatch_core::{logging, Config};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Serialize)]
struct VersionHandshake {
    version: &'static str,
    protocol_version: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|arg| arg == "--version-json") {
        let handshake = VersionHandshake {
            version: env!("CARGO_PKG_VERSION"),
            protocol_version: PROTOCOL_VERSION,
        };
        println!("{}", serde_json::to_string(&handshake)?);
        return Ok(());
    }

    let config_path = parse_config_path(&args)?;
    let config = Config::from_file(&config_path)
        .with_context(|| format!("cannot load configuration {}", config_path.display()))?;
    logging::init_with(config.logging.format);

    let listen = config.centrald.listen.clone();
    info!(
        config = %config_path.display(),
        latitude = config.observatory.latitude,
        longitude = config.observatory.longitude,
        "centrald starting"
    );

    let coordinator = Coordinator::new(config, Utc::now());
    let server = CoordinatorServer::bind(&listen, coordinator)
        .await
        .with_context(|| format!("cannot listen on {}", listen))?
        .with_reload_path(config_path);

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("cannot wait for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

fn parse_config_path(args: &[String]) -> anyhow::Result<PathBuf> {
    let mut args_iter = args.iter();
    while let Some(arg) = args_iter.next() {
        if arg == "--config" {
            if let Some(path) = args_iter.next() {
                return Ok(PathBuf::from(path));
            }
            anyhow::bail!("--config was provided without a path");
        }
    }

    anyhow::bail!("missing required --config <path> argument")
}
