use std::sync::Arc;

use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use vmforge::api::{self, AppState};
use vmforge::catalog::Catalog;
use vmforge::cli::{Cli, Command};
use vmforge::config::Config;
use vmforge::error::ForgeError;
use vmforge::hypervisor::Hypervisor;
use vmforge::nat;
use vmforge::provision::Provisioner;

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
            .add_directive("vmforge=info".parse().expect("valid log directive"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    dotenvy::dotenv().ok();
    let config = Arc::new(Config::from_env()?);
    config.ensure_directories()?;

    let catalog = Arc::new(Catalog::open(&config.db_path)?);
    let hypervisor = Arc::new(Hypervisor::new(&config.libvirt_uri));

    // Re-create firewall rules for VMs that survived a restart (or an
    // external iptables flush).
    let vms = catalog.all_vms()?;
    if !vms.is_empty() {
        let restored = nat::restore_port_forwards(&vms).await;
        tracing::info!(restored, total = vms.len(), "restored port forwards");
    }

    match cli.command {
        Command::Serve { listen } => {
            let addr = listen.unwrap_or(config.listen_addr);

            let provisioner = Provisioner::new(
                Arc::clone(&config),
                Arc::clone(&catalog),
                Arc::clone(&hypervisor),
            );
            let state = AppState {
                config,
                catalog,
                hypervisor,
                provisioner,
            };

            let app = api::router(state)
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive());

            let listener =
                tokio::net::TcpListener::bind(addr)
                    .await
                    .map_err(|e| ForgeError::Io {
                        context: format!("binding {addr}"),
                        source: e,
                    })?;
            tracing::info!(%addr, "vmforge listening");

            axum::serve(listener, app)
                .await
                .map_err(|e| ForgeError::Io {
                    context: "serving HTTP".into(),
                    source: e,
                })?;
        }
    }

    Ok(())
}
