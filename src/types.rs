use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::path::PathBuf;

pub type SuiteID = u64;
pub type TestID = u64;

/// A buildable client discovered under the clients directory. Immutable
/// after registry construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientDefinition {
    pub name: String,
    pub version: String,
    pub image: String,
    pub meta: ClientMetadata,
}

/// Contents of the optional `hive.yaml` next to a client's Dockerfile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMetadata {
    #[serde(default = "default_roles")]
    pub roles: Vec<String>,
}

impl Default for ClientMetadata {
    fn default() -> Self {
        Self { roles: default_roles() }
    }
}

fn default_roles() -> Vec<String> {
    vec!["eth1".to_string()]
}

/// A simulator image built from the simulators directory.
#[derive(Debug, Clone)]
pub struct SimulatorDefinition {
    pub name: String,
    pub image: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub pass: bool,
    pub details: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SuiteStatus {
    Open,
    Closing,
    Written,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TestStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NodeStatus {
    Running,
    Stopping,
    Gone,
}

/// One execution of a simulator. Owns its tests and virtual networks; both
/// are torn down when the suite ends, whatever their individual state.
#[derive(Debug)]
pub struct Suite {
    pub id: SuiteID,
    pub name: String,
    pub description: String,
    pub sim_log: String,
    pub started: DateTime<Utc>,
    pub ended: Option<DateTime<Utc>>,
    pub status: SuiteStatus,
    /// Ordered by test id, which is allocation order.
    pub tests: BTreeMap<TestID, TestCase>,
    /// Suite-local network name to handle.
    pub networks: HashMap<String, NetworkHandle>,
    pub watchdog: Option<tokio::task::JoinHandle<()>>,
}

#[derive(Debug)]
pub struct TestCase {
    pub id: TestID,
    pub name: String,
    pub description: String,
    pub started: DateTime<Utc>,
    pub ended: Option<DateTime<Utc>>,
    pub status: TestStatus,
    pub result: Option<TestResult>,
    /// Container id to node record. Gone nodes stay here for log references.
    pub nodes: HashMap<String, NodeInfo>,
}

/// A running client container scoped to one test.
#[derive(Debug)]
pub struct NodeInfo {
    pub id: String,
    pub client_type: String,
    pub version: String,
    /// Address on the default bridge network.
    pub ip: IpAddr,
    /// Parameters the client was launched with, as handed over by the
    /// simulator.
    pub env: HashMap<String, String>,
    /// Paths of the files written into the container before start.
    pub mounts: Vec<String>,
    pub log_file: PathBuf,
    pub status: NodeStatus,
    pub log_task: Option<tokio::task::JoinHandle<()>>,
}

/// A user-defined network created on the backend for the duration of a
/// suite. Members are referenced by container id, not by owning pointer.
#[derive(Debug)]
pub struct NetworkHandle {
    pub backend_name: String,
    pub members: HashSet<String>,
}
