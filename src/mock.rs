// In-memory container backend for tests. Tracks the same primitive
// resources the Docker driver would, counts operations, and can inject a
// failure on the nth container start.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Mutex;

use crate::container::{
    BackendError, ContainerBackend, ContainerOptions, ExecOutput, FileMount, LogStream,
    StartedContainer,
};

#[derive(Debug, Clone)]
pub struct MockContainer {
    pub id: String,
    pub image: String,
    pub env: Vec<String>,
    pub files: Vec<FileMount>,
    pub networks: HashMap<String, IpAddr>,
}

/// What a start_container call asked for, kept even after the container is
/// gone so tests can assert on it.
#[derive(Debug, Clone)]
pub struct StartRecord {
    pub image: String,
    pub env: Vec<String>,
    pub networks: Vec<String>,
}

#[derive(Default)]
struct MockState {
    counter: u64,
    subnet: u8,
    containers: HashMap<String, MockContainer>,
    start_records: Vec<StartRecord>,
    /// Backend network name to (subnet octet, members).
    networks: HashMap<String, (u8, HashSet<String>)>,
    calls: HashMap<&'static str, usize>,
    /// Start calls remaining before one injected failure, when set.
    fail_start_after: Option<usize>,
    exec_results: HashMap<String, ExecOutput>,
    /// Image tag to nocache flag seen on the last build.
    builds: HashMap<String, bool>,
}

#[derive(Default)]
pub struct MockBackend {
    state: Mutex<MockState>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the nth start_container call from now fail (1 fails the next
    /// call).
    pub fn fail_start_after(&self, n: usize) {
        self.state.lock().unwrap().fail_start_after = Some(n);
    }

    /// Override the output of `exec` for a given argv[0].
    pub fn set_exec_result(&self, cmd: &str, output: ExecOutput) {
        self.state
            .lock()
            .unwrap()
            .exec_results
            .insert(cmd.to_string(), output);
    }

    pub fn calls(&self, op: &str) -> usize {
        *self.state.lock().unwrap().calls.get(op).unwrap_or(&0)
    }

    pub fn container_count(&self) -> usize {
        self.state.lock().unwrap().containers.len()
    }

    pub fn network_count(&self) -> usize {
        self.state.lock().unwrap().networks.len()
    }

    pub fn container(&self, id: &str) -> Option<MockContainer> {
        self.state.lock().unwrap().containers.get(id).cloned()
    }

    pub fn containers(&self) -> Vec<MockContainer> {
        self.state
            .lock()
            .unwrap()
            .containers
            .values()
            .cloned()
            .collect()
    }

    pub fn build_nocache(&self, tag: &str) -> Option<bool> {
        self.state.lock().unwrap().builds.get(tag).copied()
    }

    pub fn start_record(&self, index: usize) -> Option<StartRecord> {
        self.state.lock().unwrap().start_records.get(index).cloned()
    }

    fn count(state: &mut MockState, op: &'static str) {
        *state.calls.entry(op).or_insert(0) += 1;
    }
}

fn mock_ip(subnet: u8, host: u64) -> IpAddr {
    format!("172.{}.0.{}", subnet, 2 + host % 250).parse().unwrap()
}

#[async_trait]
impl ContainerBackend for MockBackend {
    async fn build_image(
        &self,
        tag: &str,
        _context: &Path,
        nocache: bool,
    ) -> Result<String, BackendError> {
        let mut state = self.state.lock().unwrap();
        Self::count(&mut state, "build_image");
        state.builds.insert(tag.to_string(), nocache);
        Ok(format!("sha256:{}", tag.replace('/', "-")))
    }

    async fn image_file(&self, _image: &str, path: &str) -> Result<Option<Vec<u8>>, BackendError> {
        if path == "/version.txt" {
            Ok(Some(b"1.0.0\n".to_vec()))
        } else {
            Ok(None)
        }
    }

    async fn start_container(
        &self,
        opts: ContainerOptions,
    ) -> Result<StartedContainer, BackendError> {
        let mut state = self.state.lock().unwrap();
        Self::count(&mut state, "start_container");

        if let Some(remaining) = state.fail_start_after {
            if remaining <= 1 {
                state.fail_start_after = None;
                return Err(BackendError::Other("injected start failure".to_string()));
            }
            state.fail_start_after = Some(remaining - 1);
        }

        state.counter += 1;
        let host = state.counter;
        let id = format!("mock-{}", host);
        state.start_records.push(StartRecord {
            image: opts.image.clone(),
            env: opts.env.clone(),
            networks: opts.networks.clone(),
        });

        let mut networks = HashMap::new();
        networks.insert("bridge".to_string(), mock_ip(17, host));
        for name in &opts.networks {
            let (subnet, members) = state
                .networks
                .get_mut(name)
                .ok_or_else(|| BackendError::Other(format!("no such network: {}", name)))?;
            members.insert(id.clone());
            networks.insert(name.clone(), mock_ip(*subnet, host));
        }

        let container = MockContainer {
            id: id.clone(),
            image: opts.image,
            env: opts.env,
            files: opts.files,
            networks: networks.clone(),
        };
        state.containers.insert(id.clone(), container);
        Ok(StartedContainer { id, ip: networks })
    }

    async fn stop_container(&self, id: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        Self::count(&mut state, "stop_container");
        state.containers.remove(id);
        for (_, members) in state.networks.values_mut() {
            members.remove(id);
        }
        Ok(())
    }

    async fn inspect_ip(&self, id: &str, network: &str) -> Result<IpAddr, BackendError> {
        let state = self.state.lock().unwrap();
        let container = state
            .containers
            .get(id)
            .ok_or_else(|| BackendError::Other(format!("no such container: {}", id)))?;
        container
            .networks
            .get(network)
            .copied()
            .ok_or_else(|| BackendError::NotAttached(id.to_string(), network.to_string()))
    }

    async fn create_network(&self, name: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        Self::count(&mut state, "create_network");
        if state.networks.contains_key(name) {
            return Err(BackendError::Other(format!(
                "network {} already exists",
                name
            )));
        }
        state.subnet += 1;
        let subnet = 17 + state.subnet;
        state.networks.insert(name.to_string(), (subnet, HashSet::new()));
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        Self::count(&mut state, "remove_network");
        state.networks.remove(name);
        Ok(())
    }

    async fn connect_network(&self, network: &str, container: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        Self::count(&mut state, "connect_network");
        let host = state
            .containers
            .get(container)
            .map(|c| c.id.trim_start_matches("mock-").parse().unwrap_or(1))
            .ok_or_else(|| BackendError::Other(format!("no such container: {}", container)))?;
        let (subnet, members) = state
            .networks
            .get_mut(network)
            .ok_or_else(|| BackendError::Other(format!("no such network: {}", network)))?;
        members.insert(container.to_string());
        let ip = mock_ip(*subnet, host);
        state
            .containers
            .get_mut(container)
            .unwrap()
            .networks
            .insert(network.to_string(), ip);
        Ok(())
    }

    async fn disconnect_network(
        &self,
        network: &str,
        container: &str,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        Self::count(&mut state, "disconnect_network");
        if let Some((_, members)) = state.networks.get_mut(network) {
            members.remove(container);
        }
        if let Some(c) = state.containers.get_mut(container) {
            c.networks.remove(network);
        }
        Ok(())
    }

    async fn exec(
        &self,
        id: &str,
        cmd: Vec<String>,
        _user: Option<String>,
        _privileged: bool,
    ) -> Result<ExecOutput, BackendError> {
        let state = self.state.lock().unwrap();
        if !state.containers.contains_key(id) {
            return Err(BackendError::Other(format!("no such container: {}", id)));
        }
        let argv0 = cmd.first().cloned().unwrap_or_default();
        if let Some(result) = state.exec_results.get(&argv0) {
            return Ok(result.clone());
        }
        if argv0 == "/enode.sh" {
            return Ok(ExecOutput {
                stdout: format!("enode://{}@0.0.0.0:30303\n", "aa".repeat(64)),
                stderr: String::new(),
                exit_code: 0,
            });
        }
        Ok(ExecOutput {
            stdout: format!("ran {}\n", cmd.join(" ")),
            stderr: String::new(),
            exit_code: 0,
        })
    }

    async fn follow_logs(&self, id: &str) -> Result<LogStream, BackendError> {
        let line = Bytes::from(format!("log output from {}\n", id));
        Ok(Box::pin(futures_util::stream::iter(vec![Ok(line)])))
    }

    async fn wait_container(&self, id: &str) -> Result<i64, BackendError> {
        let mut state = self.state.lock().unwrap();
        Self::count(&mut state, "wait_container");
        state.containers.remove(id);
        Ok(0)
    }

    async fn network_gateway(&self, _network: &str) -> Result<IpAddr, BackendError> {
        Ok("172.17.0.1".parse().unwrap())
    }

    async fn prune_instances(&self) -> Result<(usize, usize), BackendError> {
        let mut state = self.state.lock().unwrap();
        let containers = state.containers.len();
        let networks = state.networks.len();
        state.containers.clear();
        state.networks.clear();
        Ok((containers, networks))
    }
}
