//! capsule CLI entry point.
//!
//! Loads the modules listed in a TOML config file into a [`Server`], then
//! either runs a single entrypoint (`--invoke`) or stays up serving until
//! Ctrl-C / SIGTERM.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use capsule_common::{CapabilitiesConfig, ConfigFile};
use capsule_core::CallContext;
use capsule_host::{CapabilityRouter, HttpClientCapability, KvStoreCapability, LoggerCapability};
use capsule_server::{ModuleConfig, ModuleSource, Server, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "capsule")]
#[command(about = "Pooled WebAssembly function host", version)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "CAPSULE_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Run one entrypoint and exit, as `module.entrypoint`
    #[arg(long, value_name = "MODULE.ENTRYPOINT")]
    invoke: Option<String>,

    /// Payload for `--invoke`
    #[arg(long, default_value = "", requires = "invoke")]
    payload: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let (config, base_dir) = match &args.config {
        Some(path) => {
            let config = ConfigFile::from_file(path)
                .with_context(|| format!("Failed to load {}", path.display()))?;
            let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
            (config, base_dir)
        }
        None => (ConfigFile::default(), PathBuf::new()),
    };

    let router = build_router(&config.capabilities)?;
    info!(namespaces = ?router.namespaces(), "Capabilities registered");

    let server_config =
        ServerConfig::new(Arc::new(router)).with_runtime(config.runtime.clone());
    let server = Server::new(server_config)?;

    let default_pool_size = config.runtime.pool.default_size;
    for entry in &config.modules {
        let mut module = ModuleConfig::from_entry(entry, default_pool_size);
        module.source = ModuleSource::File(base_dir.join(&entry.path));
        server
            .load_module(module)
            .await
            .with_context(|| format!("Failed to load module '{}'", entry.name))?;
    }
    info!(modules = ?server.modules(), "Modules loaded");

    let result = match &args.invoke {
        Some(target) => invoke(&server, target, args.payload.as_bytes()).await,
        None => {
            shutdown_signal().await;
            Ok(())
        }
    };

    server.shutdown().await;
    result
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,capsule=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn build_router(capabilities: &CapabilitiesConfig) -> anyhow::Result<CapabilityRouter> {
    let mut router = CapabilityRouter::new();

    if capabilities.httpclient.enabled {
        let http = HttpClientCapability::new(&capabilities.httpclient)
            .context("Failed to build HTTP client")?;
        router = router.with(http);
    }
    if capabilities.kvstore.enabled {
        router = router.with(KvStoreCapability::new());
    }
    if capabilities.logger.enabled {
        router = router.with(LoggerCapability::new());
    }

    Ok(router)
}

async fn invoke(server: &Server, target: &str, payload: &[u8]) -> anyhow::Result<()> {
    let Some((module, entrypoint)) = target.split_once('.') else {
        bail!("--invoke expects MODULE.ENTRYPOINT, got '{target}'");
    };

    let ctx = CallContext::new();
    info!(request_id = %ctx.request_id(), module, entrypoint, "Invoking");

    let output = server.execute(module, entrypoint, payload, &ctx).await?;
    println!("{}", String::from_utf8_lossy(&output));
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
