// Top-level simulation driver. Starts one simulator container at a time,
// points it at the control plane, and cleans up whatever it leaves behind.

use chrono::Utc;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use crate::container::{ContainerBackend, ContainerOptions};
use crate::manager::TestManager;
use crate::types::SimulatorDefinition;

pub struct RunnerConfig {
    /// Control-plane URL reachable from inside containers.
    pub api_url: String,
    pub results_root: PathBuf,
    /// Client containers a simulator may drive concurrently.
    pub parallelism: usize,
    pub loglevel: u8,
    /// Wall-clock budget per simulator run.
    pub timelimit: Option<Duration>,
}

/// Run the selected simulators in order. A simulator failure is logged and
/// does not abort the remaining runs; authoritative results are the
/// per-test results each simulator reported.
pub async fn run_simulators(
    manager: Arc<TestManager>,
    backend: Arc<dyn ContainerBackend>,
    simulators: Vec<SimulatorDefinition>,
    config: &RunnerConfig,
) -> anyhow::Result<()> {
    for sim in simulators {
        tracing::info!("running simulator {}", sim.name);
        if let Err(err) = run_one(&manager, &backend, &sim, config).await {
            tracing::error!("simulator {} failed: {}", sim.name, err);
        }

        let ended = manager.force_end_open_suites().await;
        if ended > 0 {
            tracing::warn!(
                "simulator {} left {} suite(s) open, force-ended",
                sim.name,
                ended
            );
        }
    }
    Ok(())
}

async fn run_one(
    manager: &Arc<TestManager>,
    backend: &Arc<dyn ContainerBackend>,
    sim: &SimulatorDefinition,
    config: &RunnerConfig,
) -> anyhow::Result<()> {
    let log_name = format!(
        "{}-simulator-{}.log",
        Utc::now().timestamp_millis(),
        sim.name.replace('/', "_")
    );

    let env = vec![
        format!("HIVE_SIMULATOR={}", config.api_url),
        format!("HIVE_SIMLOG={}", log_name),
        format!("HIVE_PARALLELISM={}", config.parallelism),
        format!("HIVE_LOGLEVEL={}", config.loglevel),
    ];
    let mut labels = HashMap::new();
    labels.insert("hive.type".to_string(), "simulator".to_string());

    let started = backend
        .start_container(ContainerOptions {
            image: sim.image.clone(),
            env,
            labels,
            ..Default::default()
        })
        .await?;
    manager.set_simulator(Some(started.id.clone()));

    let log_task = tokio::spawn(capture_sim_log(
        backend.clone(),
        started.id.clone(),
        config.results_root.join(&log_name),
    ));

    let exited = match config.timelimit {
        Some(limit) => {
            match tokio::time::timeout(limit, backend.wait_container(&started.id)).await {
                Ok(result) => Some(result?),
                Err(_) => {
                    tracing::warn!(
                        "simulator {} exceeded its time limit, killing it",
                        sim.name
                    );
                    None
                }
            }
        }
        None => Some(backend.wait_container(&started.id).await?),
    };
    match exited {
        Some(code) if code != 0 => {
            tracing::warn!("simulator {} exited with code {}", sim.name, code)
        }
        Some(_) => tracing::info!("simulator {} finished", sim.name),
        None => {}
    }

    manager.set_simulator(None);
    if let Err(err) = backend.stop_container(&started.id).await {
        tracing::error!("failed to remove simulator container {}: {}", started.id, err);
    }
    if tokio::time::timeout(Duration::from_secs(5), log_task)
        .await
        .is_err()
    {
        tracing::warn!("simulator log capture for {} did not finish", sim.name);
    }
    Ok(())
}

async fn capture_sim_log(backend: Arc<dyn ContainerBackend>, id: String, path: PathBuf) {
    let mut stream = match backend.follow_logs(&id).await {
        Ok(stream) => stream,
        Err(err) => {
            tracing::warn!("cannot follow simulator logs: {}", err);
            return;
        }
    };
    let mut file = match tokio::fs::File::create(&path).await {
        Ok(file) => file,
        Err(err) => {
            tracing::warn!("cannot create {}: {}", path.display(), err);
            return;
        }
    };
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                if file.write_all(&bytes).await.is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    let _ = file.flush().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBackend;
    use crate::types::ClientDefinition;

    fn runner_config(root: &std::path::Path) -> RunnerConfig {
        RunnerConfig {
            api_url: "http://172.17.0.1:3000".to_string(),
            results_root: root.to_path_buf(),
            parallelism: 2,
            loglevel: 3,
            timelimit: None,
        }
    }

    fn test_manager(backend: Arc<MockBackend>, root: &std::path::Path) -> Arc<TestManager> {
        let mut clients = HashMap::new();
        clients.insert(
            "geth".to_string(),
            ClientDefinition {
                name: "geth".to_string(),
                version: "1.0.0".to_string(),
                image: "hive/clients/geth".to_string(),
                meta: Default::default(),
            },
        );
        TestManager::new(
            backend,
            clients,
            root.to_path_buf(),
            None,
            "runner-test".to_string(),
        )
    }

    #[tokio::test]
    async fn simulator_gets_the_control_plane_environment() {
        let root = tempfile::tempdir().unwrap();
        let backend = Arc::new(MockBackend::new());
        let manager = test_manager(backend.clone(), root.path());

        let sims = vec![SimulatorDefinition {
            name: "smoke".to_string(),
            image: "hive/simulators/smoke".to_string(),
        }];

        // The suite a crashed simulator would leave open.
        let sid = manager.start_suite("orphan".into(), String::new(), String::new());

        run_simulators(manager.clone(), backend.clone(), sims, &runner_config(root.path()))
            .await
            .unwrap();

        // The wait call consumed the simulator, the stop is a no-op, and
        // the orphaned suite was force-ended with a report on disk.
        assert_eq!(backend.container_count(), 0);
        let reports: Vec<_> = std::fs::read_dir(root.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "json").unwrap_or(false))
            .collect();
        assert_eq!(reports.len(), 1);
        let _ = sid;

        let logs: Vec<_> = std::fs::read_dir(root.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.contains("-simulator-smoke.log"))
            .collect();
        assert_eq!(logs.len(), 1);
    }

    #[tokio::test]
    async fn simulator_environment_contains_hive_variables() {
        let root = tempfile::tempdir().unwrap();
        let backend = Arc::new(MockBackend::new());
        let manager = test_manager(backend.clone(), root.path());

        let sim = SimulatorDefinition {
            name: "devp2p".to_string(),
            image: "hive/simulators/devp2p".to_string(),
        };
        let dyn_backend: Arc<dyn ContainerBackend> = backend.clone();
        run_one(&manager, &dyn_backend, &sim, &runner_config(root.path()))
            .await
            .unwrap();

        let record = backend.start_record(0).unwrap();
        assert_eq!(record.image, "hive/simulators/devp2p");
        assert!(record
            .env
            .iter()
            .any(|e| e == "HIVE_SIMULATOR=http://172.17.0.1:3000"));
        assert!(record.env.iter().any(|e| e == "HIVE_PARALLELISM=2"));
        assert!(record.env.iter().any(|e| e.starts_with("HIVE_SIMLOG=")));
    }
}
