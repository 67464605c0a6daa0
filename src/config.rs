use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line interface of the host.
#[derive(Debug, Parser)]
#[command(name = "hive", about = "Ethereum end-to-end test harness")]
pub struct Opts {
    /// Glob selecting the simulators to run. May be given more than once;
    /// every discovered simulator runs when absent.
    #[arg(long = "sim")]
    pub sim: Vec<String>,

    /// Comma-separated allow-list of client types to build. Empty builds
    /// every discovered client.
    #[arg(long = "client", value_delimiter = ',')]
    pub clients: Vec<String>,

    /// Maximum number of client containers a simulator may drive
    /// concurrently.
    #[arg(long = "sim.parallelism", default_value_t = 1)]
    pub sim_parallelism: usize,

    /// Wall-clock limit in seconds applied to each suite and to each
    /// simulator run. Unlimited when absent.
    #[arg(long = "sim.timelimit")]
    pub sim_timelimit: Option<u64>,

    /// Directory the result files and logs are written to.
    #[arg(long = "results-root", default_value = "workspace/logs")]
    pub results_root: PathBuf,

    /// Comma-separated regular expressions naming images to rebuild
    /// without the build cache.
    #[arg(long = "docker-nocache", value_delimiter = ',')]
    pub docker_nocache: Vec<String>,

    /// Log verbosity, 0 (errors only) through 6 (everything).
    #[arg(long = "loglevel", default_value_t = 3)]
    pub loglevel: u8,

    /// Directory tree holding the client definitions.
    #[arg(long = "clients-dir", default_value = "clients")]
    pub clients_dir: PathBuf,

    /// Directory tree holding the simulator definitions.
    #[arg(long = "sims-dir", default_value = "simulators")]
    pub sims_dir: PathBuf,
}

/// Environment-sourced settings, prefixed HIVE_ (HIVE_DOCKER_ENDPOINT,
/// HIVE_LISTEN_ADDR). A .env file is honoured when present.
#[derive(Debug, Deserialize, Clone)]
pub struct Env {
    pub docker_endpoint: String,
    pub listen_addr: String,
}

pub fn load_env() -> anyhow::Result<Env> {
    dotenvy::dotenv().ok();

    let config = config::Config::builder()
        .set_default("docker_endpoint", "unix:///var/run/docker.sock")?
        .set_default("listen_addr", "0.0.0.0:0")?
        .add_source(config::Environment::with_prefix("HIVE"))
        .build()?;

    Ok(config.try_deserialize()?)
}

/// Map the numeric loglevel onto a tracing filter directive. RUST_LOG
/// overrides this entirely.
pub fn log_filter(loglevel: u8) -> &'static str {
    match loglevel {
        0 => "error",
        1 => "warn",
        2 | 3 => "info",
        4 => "debug",
        _ => "trace",
    }
}
