mod api;
mod builder;
mod config;
mod container;
mod manager;
#[cfg(test)]
mod mock;
mod results;
mod runner;
mod types;

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

use crate::builder::ImageBuilder;
use crate::container::{ContainerBackend, DockerBackend};
use crate::manager::TestManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = config::Opts::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| config::log_filter(opts.loglevel).to_string()),
        )
        .init();

    let env = config::load_env()?;
    let instance = uuid::Uuid::new_v4().simple().to_string();
    tracing::info!("hive instance {}", instance);

    let backend = DockerBackend::connect(&env.docker_endpoint, instance.clone())
        .await
        .context("container backend unreachable")?;
    let backend: Arc<dyn ContainerBackend> = Arc::new(backend);

    // A previous host may have crashed mid-run; its containers and networks
    // carry our label and are safe to delete.
    let (containers, networks) = backend.prune_instances().await?;
    if containers > 0 || networks > 0 {
        tracing::info!(
            "removed {} stale container(s) and {} stale network(s)",
            containers,
            networks
        );
    }

    std::fs::create_dir_all(&opts.results_root).with_context(|| {
        format!("cannot create results root {}", opts.results_root.display())
    })?;

    let builder = ImageBuilder::new(backend.clone(), &opts.docker_nocache)
        .context("invalid --docker-nocache pattern")?;

    let clients = builder
        .build_clients(&opts.clients_dir, &opts.clients)
        .await
        .context("client build failed")?;
    if clients.is_empty() {
        anyhow::bail!("no clients found under {}", opts.clients_dir.display());
    }
    tracing::info!("{} client(s) ready", clients.len());

    let simulators = builder
        .build_simulators(&opts.sims_dir, &opts.sim)
        .await
        .context("simulator build failed")?;
    if simulators.is_empty() {
        anyhow::bail!(
            "no simulators matching {:?} under {}",
            opts.sim,
            opts.sims_dir.display()
        );
    }

    let timelimit = opts.sim_timelimit.map(Duration::from_secs);
    let manager = TestManager::new(
        backend.clone(),
        clients,
        opts.results_root.clone(),
        timelimit,
        instance,
    );

    let listener = tokio::net::TcpListener::bind(&env.listen_addr)
        .await
        .with_context(|| format!("cannot bind control plane on {}", env.listen_addr))?;
    let local_addr = listener.local_addr()?;
    tracing::info!("control plane listening on {}", local_addr);

    let app = api::router(manager.clone());
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!("control plane server failed: {}", err);
        }
    });

    // Containers dial the control plane through the bridge gateway.
    let gateway = backend
        .network_gateway(manager::BRIDGE_NETWORK)
        .await
        .context("cannot determine bridge gateway")?;
    let runner_config = runner::RunnerConfig {
        api_url: format!("http://{}:{}", gateway, local_addr.port()),
        results_root: opts.results_root.clone(),
        parallelism: opts.sim_parallelism,
        loglevel: opts.loglevel,
        timelimit,
    };

    runner::run_simulators(manager, backend, simulators, &runner_config).await?;

    tracing::info!("all simulations done, results in {}", opts.results_root.display());
    Ok(())
}
