// Suite/test/node lifecycle manager.
//
// All state mutations are serialized through one coarse mutex. The lock is
// never held across backend I/O: every mutating operation checks
// preconditions and reserves state under the lock, performs backend work
// unlocked, then reacquires the lock to commit or roll back.

use bytes::Bytes;
use chrono::Utc;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;

use crate::container::{ContainerBackend, ContainerOptions, ExecOutput, FileMount};
use crate::results::{self, SuiteReport};
use crate::types::{
    ClientDefinition, NetworkHandle, NodeInfo, NodeStatus, Suite, SuiteID, SuiteStatus, TestCase,
    TestID, TestResult, TestStatus,
};

/// Network name reserved for the runtime default bridge.
pub const BRIDGE_NETWORK: &str = "bridge";
/// Container id reserved for the simulator of the enclosing run.
pub const SIMULATION_CONTAINER: &str = "simulation";

/// Result recorded for tests still open when their suite goes away.
const ABANDONED_TEST_DETAILS: &str = "suite ended with open test";

const LOG_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum HiveError {
    #[error("no such test suite")]
    NoSuchSuite,
    #[error("no such test case")]
    NoSuchTest,
    #[error("no such node")]
    NoSuchNode,
    #[error("no such network")]
    NoSuchNetwork,
    #[error("missing CLIENT parameter in client start request")]
    MissingClientType,
    #[error("unknown client type {0:?}")]
    UnknownClientType(String),
    #[error("network name {0:?} is reserved")]
    ReservedNetworkName(String),
    #[error("network {0:?} already exists")]
    DuplicateNetwork(String),
    #[error("no simulator container is active")]
    NoSimulator,
    #[error("enode script failed: {0}")]
    EnodeFailure(String),
    #[error(transparent)]
    Backend(#[from] crate::container::BackendError),
    #[error("cannot write result file: {0}")]
    Io(#[from] std::io::Error),
}

struct ManagerState {
    next_suite_id: SuiteID,
    next_test_id: TestID,
    suites: HashMap<SuiteID, Suite>,
    simulator: Option<String>,
}

pub struct TestManager {
    weak: Weak<TestManager>,
    backend: Arc<dyn ContainerBackend>,
    clients: HashMap<String, ClientDefinition>,
    results_root: PathBuf,
    suite_timeout: Option<Duration>,
    instance: String,
    state: Mutex<ManagerState>,
}

impl TestManager {
    pub fn new(
        backend: Arc<dyn ContainerBackend>,
        clients: HashMap<String, ClientDefinition>,
        results_root: PathBuf,
        suite_timeout: Option<Duration>,
        instance: String,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            backend,
            clients,
            results_root,
            suite_timeout,
            instance,
            state: Mutex::new(ManagerState {
                next_suite_id: 1,
                next_test_id: 1,
                suites: HashMap::new(),
                simulator: None,
            }),
        })
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn client_definitions(&self) -> Vec<ClientDefinition> {
        let mut defs: Vec<_> = self.clients.values().cloned().collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Record the simulator container of the current run so that the
    /// reserved id `simulation` can be resolved.
    pub fn set_simulator(&self, container: Option<String>) {
        self.state.lock().unwrap().simulator = container;
    }

    // === Suites ===

    pub fn start_suite(&self, name: String, description: String, sim_log: String) -> SuiteID {
        let id = {
            let mut st = self.state.lock().unwrap();
            let id = st.next_suite_id;
            st.next_suite_id += 1;
            st.suites.insert(
                id,
                Suite {
                    id,
                    name,
                    description,
                    sim_log,
                    started: Utc::now(),
                    ended: None,
                    status: SuiteStatus::Open,
                    tests: Default::default(),
                    networks: Default::default(),
                    watchdog: None,
                },
            );
            id
        };

        if let Some(limit) = self.suite_timeout {
            let weak = self.weak.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                let Some(mgr) = weak.upgrade() else { return };
                // Drop our own handle first so end_suite does not abort the
                // very task running it.
                if let Some(suite) = mgr.state.lock().unwrap().suites.get_mut(&id) {
                    suite.watchdog.take();
                }
                tracing::warn!("suite {} exceeded its time limit, terminating", id);
                if let Err(err) = mgr.end_suite(id).await {
                    tracing::error!("failed to end expired suite {}: {}", id, err);
                }
            });
            let mut st = self.state.lock().unwrap();
            match st.suites.get_mut(&id) {
                Some(suite) if suite.status == SuiteStatus::Open => suite.watchdog = Some(handle),
                _ => handle.abort(),
            }
        }

        tracing::info!("suite {} started", id);
        id
    }

    /// Tear down everything the suite owns and write its report. Calling it
    /// again once teardown has begun is a no-op.
    pub async fn end_suite(&self, sid: SuiteID) -> Result<(), HiveError> {
        let (nodes, networks, watchdog) = {
            let mut st = self.state.lock().unwrap();
            let suite = st.suites.get_mut(&sid).ok_or(HiveError::NoSuchSuite)?;
            if suite.status != SuiteStatus::Open {
                return Ok(());
            }
            suite.status = SuiteStatus::Closing;

            let now = Utc::now();
            let mut nodes = Vec::new();
            for test in suite.tests.values_mut() {
                if test.status == TestStatus::Open {
                    test.status = TestStatus::Closed;
                    test.ended = Some(now);
                    test.result = Some(TestResult {
                        pass: false,
                        details: ABANDONED_TEST_DETAILS.to_string(),
                    });
                }
                for node in test.nodes.values_mut() {
                    if node.status != NodeStatus::Gone {
                        node.status = NodeStatus::Stopping;
                        nodes.push((test.id, node.id.clone(), node.log_task.take()));
                    }
                }
            }
            let networks: Vec<(String, NetworkHandle)> = suite.networks.drain().collect();
            (nodes, networks, suite.watchdog.take())
        };

        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }

        // Teardown is best-effort: log failures and keep sweeping.
        for (tid, cid, log_task) in nodes {
            if let Err(err) = self.backend.stop_container(&cid).await {
                tracing::error!("failed to remove container {}: {}", cid, err);
            }
            if let Some(task) = log_task {
                drain_log_task(task).await;
            }
            let mut st = self.state.lock().unwrap();
            if let Some(node) = st
                .suites
                .get_mut(&sid)
                .and_then(|s| s.tests.get_mut(&tid))
                .and_then(|t| t.nodes.get_mut(&cid))
            {
                node.status = NodeStatus::Gone;
            }
        }
        for (name, handle) in networks {
            if let Err(err) = self.backend.remove_network(&handle.backend_name).await {
                tracing::error!("failed to remove network {}: {}", name, err);
            }
        }

        let (report, elapsed) = {
            let mut st = self.state.lock().unwrap();
            let suite = st.suites.get_mut(&sid).ok_or(HiveError::NoSuchSuite)?;
            suite.ended = Some(Utc::now());
            suite.status = SuiteStatus::Written;
            let elapsed = suite
                .ended
                .map(|end| end - suite.started)
                .unwrap_or_else(chrono::Duration::zero);
            (SuiteReport::from_suite(suite), elapsed)
        };
        let file = results::write_suite(&self.results_root, sid, &report).map_err(|err| {
            tracing::error!("failed to write result file for suite {}: {}", sid, err);
            err
        })?;
        tracing::info!(
            "suite {} ended after {}s, results in {}",
            sid,
            elapsed.num_seconds(),
            file.display()
        );
        Ok(())
    }

    /// End every suite still open, in id order. Used when a simulator exits
    /// or is killed. Returns how many suites were closed.
    pub async fn force_end_open_suites(&self) -> usize {
        let mut open: Vec<SuiteID> = {
            let st = self.state.lock().unwrap();
            st.suites
                .values()
                .filter(|s| s.status == SuiteStatus::Open)
                .map(|s| s.id)
                .collect()
        };
        open.sort_unstable();

        let mut ended = 0;
        for sid in open {
            match self.end_suite(sid).await {
                Ok(()) => ended += 1,
                Err(err) => tracing::error!("failed to force-end suite {}: {}", sid, err),
            }
        }
        ended
    }

    // === Tests ===

    pub fn start_test(
        &self,
        sid: SuiteID,
        name: String,
        description: String,
    ) -> Result<TestID, HiveError> {
        let mut guard = self.state.lock().unwrap();
        let st = &mut *guard;
        let suite = open_suite(&mut st.suites, sid)?;
        let id = st.next_test_id;
        st.next_test_id += 1;
        suite.tests.insert(
            id,
            TestCase {
                id,
                name,
                description,
                started: Utc::now(),
                ended: None,
                status: TestStatus::Open,
                result: None,
                nodes: HashMap::new(),
            },
        );
        Ok(id)
    }

    /// Record the result and tear down every node the test owns. Ending an
    /// already-closed test in a live suite is a no-op.
    pub async fn end_test(
        &self,
        sid: SuiteID,
        tid: TestID,
        result: TestResult,
    ) -> Result<(), HiveError> {
        let nodes = {
            let mut st = self.state.lock().unwrap();
            let suite = open_suite(&mut st.suites, sid)?;
            let test = suite.tests.get_mut(&tid).ok_or(HiveError::NoSuchTest)?;
            if test.status == TestStatus::Closed {
                return Ok(());
            }
            test.status = TestStatus::Closed;
            test.ended = Some(Utc::now());
            test.result = Some(result);

            let mut nodes = Vec::new();
            for node in test.nodes.values_mut() {
                if node.status != NodeStatus::Gone {
                    node.status = NodeStatus::Stopping;
                    nodes.push((node.id.clone(), node.log_task.take()));
                }
            }
            nodes
        };

        for (cid, log_task) in nodes {
            if let Err(err) = self.backend.stop_container(&cid).await {
                tracing::error!("failed to remove container {}: {}", cid, err);
            }
            if let Some(task) = log_task {
                drain_log_task(task).await;
            }
            let mut st = self.state.lock().unwrap();
            if let Some(node) = st
                .suites
                .get_mut(&sid)
                .and_then(|s| s.tests.get_mut(&tid))
                .and_then(|t| t.nodes.get_mut(&cid))
            {
                node.status = NodeStatus::Gone;
            }
        }
        Ok(())
    }

    // === Nodes ===

    /// Launch a client container for a test. `params` is forwarded into the
    /// container environment verbatim; the reserved `CLIENT` key selects
    /// the client type and `HIVE_CLIENT_NETWORK` an extra suite network.
    pub async fn start_client(
        &self,
        sid: SuiteID,
        tid: TestID,
        params: HashMap<String, String>,
        files: Vec<FileMount>,
        tar_archives: Vec<Bytes>,
    ) -> Result<(String, IpAddr), HiveError> {
        // Phase 1: validate and resolve everything under the lock.
        let (definition, extra_networks) = {
            let mut st = self.state.lock().unwrap();
            let suite = open_suite(&mut st.suites, sid)?;
            let client_name = params.get("CLIENT").ok_or(HiveError::MissingClientType)?;
            let definition = self
                .clients
                .get(client_name)
                .cloned()
                .ok_or_else(|| HiveError::UnknownClientType(client_name.clone()))?;
            open_test(suite, tid)?;

            let mut extra = Vec::new();
            if let Some(network) = params.get("HIVE_CLIENT_NETWORK") {
                let handle = suite
                    .networks
                    .get(network)
                    .ok_or(HiveError::NoSuchNetwork)?;
                extra.push(handle.backend_name.clone());
            }
            (definition, extra)
        };

        // Phase 2: backend work, no lock held.
        let mut env: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        env.sort();
        let mounts: Vec<String> = files.iter().map(|f| f.container_path.clone()).collect();
        let mut labels = HashMap::new();
        labels.insert("hive.type".to_string(), "client".to_string());
        labels.insert("hive.suite".to_string(), sid.to_string());
        let started = self
            .backend
            .start_container(ContainerOptions {
                image: definition.image.clone(),
                name: None,
                env,
                files,
                tar_archives,
                networks: extra_networks,
                labels,
            })
            .await?;

        let ip = started
            .ip
            .get(BRIDGE_NETWORK)
            .copied()
            .ok_or_else(|| {
                crate::container::BackendError::Other(format!(
                    "container {} has no bridge address",
                    started.id
                ))
            })?;

        let log_file = self.results_root.join(format!("{}.log", started.id));
        let log_task = tokio::spawn(pipe_logs(
            self.backend.clone(),
            started.id.clone(),
            log_file.clone(),
        ));

        // Phase 3: commit, or roll the container back if the test died
        // while we were starting it.
        let rolled_back = {
            let mut st = self.state.lock().unwrap();
            match open_suite(&mut st.suites, sid).and_then(|suite| open_test(suite, tid)) {
                Ok(test) => {
                    let node = NodeInfo {
                        id: started.id.clone(),
                        client_type: definition.name.clone(),
                        version: definition.version.clone(),
                        ip,
                        env: params,
                        mounts,
                        log_file,
                        status: NodeStatus::Running,
                        log_task: Some(log_task),
                    };
                    tracing::debug!(
                        "client {} launched with {} parameter(s) and {} mount(s)",
                        node.id,
                        node.env.len(),
                        node.mounts.len()
                    );
                    test.nodes.insert(started.id.clone(), node);
                    None
                }
                Err(err) => Some((err, log_task)),
            }
        };
        if let Some((err, log_task)) = rolled_back {
            tracing::warn!(
                "test {} ended while client was starting, removing {}",
                tid,
                started.id
            );
            let _ = self.backend.stop_container(&started.id).await;
            log_task.abort();
            return Err(err);
        }

        tracing::info!(
            "client {} ({}) started for test {} at {}",
            started.id,
            definition.name,
            tid,
            ip
        );
        Ok((started.id, ip))
    }

    /// Force-stop a node and mark it gone. Stopping a node that is already
    /// gone is a no-op.
    pub async fn stop_client(
        &self,
        sid: SuiteID,
        tid: TestID,
        node: &str,
    ) -> Result<(), HiveError> {
        let pending = {
            let mut st = self.state.lock().unwrap();
            let suite = open_suite(&mut st.suites, sid)?;
            let test = open_test(suite, tid)?;
            let info = test.nodes.get_mut(node).ok_or(HiveError::NoSuchNode)?;
            match info.status {
                NodeStatus::Running => {
                    info.status = NodeStatus::Stopping;
                    Some(info.log_task.take())
                }
                NodeStatus::Stopping | NodeStatus::Gone => None,
            }
        };
        let Some(log_task) = pending else {
            return Ok(());
        };

        match self.backend.stop_container(node).await {
            Ok(()) => {
                if let Some(task) = log_task {
                    drain_log_task(task).await;
                }
                let mut st = self.state.lock().unwrap();
                if let Some(info) = st
                    .suites
                    .get_mut(&sid)
                    .and_then(|s| s.tests.get_mut(&tid))
                    .and_then(|t| t.nodes.get_mut(node))
                {
                    info.status = NodeStatus::Gone;
                }
                Ok(())
            }
            Err(err) => {
                // Roll the reservation back so a retry is possible.
                let mut st = self.state.lock().unwrap();
                if let Some(info) = st
                    .suites
                    .get_mut(&sid)
                    .and_then(|s| s.tests.get_mut(&tid))
                    .and_then(|t| t.nodes.get_mut(node))
                {
                    info.status = NodeStatus::Running;
                    info.log_task = log_task;
                }
                Err(err.into())
            }
        }
    }

    /// Run the client's enode script and return its devp2p URL with the
    /// node's bridge address substituted for whatever the script printed.
    pub async fn enode_url(
        &self,
        sid: SuiteID,
        tid: TestID,
        node: &str,
    ) -> Result<String, HiveError> {
        let ip = self.running_node(sid, tid, node)?;
        let output = self
            .backend
            .exec(node, vec!["/enode.sh".to_string()], None, false)
            .await?;
        if output.exit_code != 0 {
            return Err(HiveError::EnodeFailure(format!(
                "exit code {} ({})",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        let url = output.stdout.trim();
        rewrite_enode_host(url, ip)
            .ok_or_else(|| HiveError::EnodeFailure(format!("malformed enode URL {:?}", url)))
    }

    pub async fn run_program(
        &self,
        sid: SuiteID,
        tid: TestID,
        node: &str,
        cmd: Vec<String>,
        user: Option<String>,
        privileged: bool,
    ) -> Result<ExecOutput, HiveError> {
        self.running_node(sid, tid, node)?;
        Ok(self.backend.exec(node, cmd, user, privileged).await?)
    }

    fn running_node(&self, sid: SuiteID, tid: TestID, node: &str) -> Result<IpAddr, HiveError> {
        let mut st = self.state.lock().unwrap();
        let suite = open_suite(&mut st.suites, sid)?;
        let test = open_test(suite, tid)?;
        let info = test.nodes.get(node).ok_or(HiveError::NoSuchNode)?;
        if info.status != NodeStatus::Running {
            return Err(HiveError::NoSuchNode);
        }
        Ok(info.ip)
    }

    // === Networks ===

    pub async fn create_network(&self, sid: SuiteID, name: &str) -> Result<(), HiveError> {
        if name == BRIDGE_NETWORK {
            return Err(HiveError::ReservedNetworkName(name.to_string()));
        }
        // Backend names are prefixed with the suite id so concurrent suites
        // may reuse the same suite-local name.
        let backend_name = format!("hive-{}-{}", sid, name);
        {
            let mut st = self.state.lock().unwrap();
            let suite = open_suite(&mut st.suites, sid)?;
            if suite.networks.contains_key(name) {
                return Err(HiveError::DuplicateNetwork(name.to_string()));
            }
            suite.networks.insert(
                name.to_string(),
                NetworkHandle {
                    backend_name: backend_name.clone(),
                    members: Default::default(),
                },
            );
        }

        if let Err(err) = self.backend.create_network(&backend_name).await {
            let mut st = self.state.lock().unwrap();
            if let Some(suite) = st.suites.get_mut(&sid) {
                suite.networks.remove(name);
            }
            return Err(err.into());
        }
        Ok(())
    }

    pub async fn remove_network(&self, sid: SuiteID, name: &str) -> Result<(), HiveError> {
        if name == BRIDGE_NETWORK {
            return Err(HiveError::ReservedNetworkName(name.to_string()));
        }
        let handle = {
            let mut st = self.state.lock().unwrap();
            let suite = open_suite(&mut st.suites, sid)?;
            suite.networks.remove(name).ok_or(HiveError::NoSuchNetwork)?
        };

        if let Err(err) = self.backend.remove_network(&handle.backend_name).await {
            let mut st = self.state.lock().unwrap();
            if let Some(suite) = st.suites.get_mut(&sid) {
                suite.networks.insert(name.to_string(), handle);
            }
            return Err(err.into());
        }
        Ok(())
    }

    pub async fn connect_container(
        &self,
        sid: SuiteID,
        name: &str,
        container: &str,
    ) -> Result<(), HiveError> {
        let (backend_name, container) = self.resolve_endpoint(sid, name, container)?;
        self.backend
            .connect_network(&backend_name, &container)
            .await?;
        let mut st = self.state.lock().unwrap();
        if let Some(handle) = st
            .suites
            .get_mut(&sid)
            .and_then(|s| s.networks.get_mut(name))
        {
            handle.members.insert(container);
        }
        Ok(())
    }

    pub async fn disconnect_container(
        &self,
        sid: SuiteID,
        name: &str,
        container: &str,
    ) -> Result<(), HiveError> {
        let (backend_name, container) = self.resolve_endpoint(sid, name, container)?;
        self.backend
            .disconnect_network(&backend_name, &container)
            .await?;
        let mut st = self.state.lock().unwrap();
        if let Some(handle) = st
            .suites
            .get_mut(&sid)
            .and_then(|s| s.networks.get_mut(name))
        {
            handle.members.remove(&container);
        }
        Ok(())
    }

    pub async fn container_ip(
        &self,
        sid: SuiteID,
        name: &str,
        container: &str,
    ) -> Result<IpAddr, HiveError> {
        let (backend_name, container) = self.resolve_endpoint(sid, name, container)?;
        Ok(self.backend.inspect_ip(&container, &backend_name).await?)
    }

    /// Resolve a suite-local network name and the reserved container id
    /// `simulation` into backend identifiers.
    fn resolve_endpoint(
        &self,
        sid: SuiteID,
        name: &str,
        container: &str,
    ) -> Result<(String, String), HiveError> {
        let mut st = self.state.lock().unwrap();
        let simulator = st.simulator.clone();
        let suite = open_suite(&mut st.suites, sid)?;
        let backend_name = if name == BRIDGE_NETWORK {
            BRIDGE_NETWORK.to_string()
        } else {
            suite
                .networks
                .get(name)
                .map(|h| h.backend_name.clone())
                .ok_or(HiveError::NoSuchNetwork)?
        };
        let container = if container == SIMULATION_CONTAINER {
            simulator.ok_or(HiveError::NoSimulator)?
        } else {
            container.to_string()
        };
        Ok((backend_name, container))
    }
}

fn open_suite(
    suites: &mut HashMap<SuiteID, Suite>,
    sid: SuiteID,
) -> Result<&mut Suite, HiveError> {
    suites
        .get_mut(&sid)
        .filter(|s| s.status == SuiteStatus::Open)
        .ok_or(HiveError::NoSuchSuite)
}

fn open_test(suite: &mut Suite, tid: TestID) -> Result<&mut TestCase, HiveError> {
    suite
        .tests
        .get_mut(&tid)
        .filter(|t| t.status == TestStatus::Open)
        .ok_or(HiveError::NoSuchTest)
}

/// Replace the host part of an enode URL. Clients usually print their
/// listen address (often 0.0.0.0); the bridge address is what peers dial.
fn rewrite_enode_host(url: &str, ip: IpAddr) -> Option<String> {
    if !url.starts_with("enode://") {
        return None;
    }
    let (head, tail) = url.split_once('@')?;
    let (_, port) = tail.split_once(':')?;
    Some(format!("{}@{}:{}", head, ip, port))
}

/// Copy a container's log stream to disk until the container goes away.
async fn pipe_logs(backend: Arc<dyn ContainerBackend>, id: String, path: PathBuf) {
    let mut stream = match backend.follow_logs(&id).await {
        Ok(stream) => stream,
        Err(err) => {
            tracing::warn!("cannot follow logs of {}: {}", id, err);
            return;
        }
    };
    let mut file = match tokio::fs::File::create(&path).await {
        Ok(file) => file,
        Err(err) => {
            tracing::warn!("cannot create log file {}: {}", path.display(), err);
            return;
        }
    };
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                if let Err(err) = file.write_all(&bytes).await {
                    tracing::warn!("log write to {} failed: {}", path.display(), err);
                    break;
                }
            }
            Err(_) => break,
        }
    }
    let _ = file.flush().await;
}

async fn drain_log_task(mut task: JoinHandle<()>) {
    if tokio::time::timeout(LOG_FLUSH_TIMEOUT, &mut task)
        .await
        .is_err()
    {
        task.abort();
    }
}
