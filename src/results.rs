// Suite report serialization. One JSON file per finished suite, written
// atomically next to the per-node and simulator log files it references.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::types::{Suite, SuiteID, TestID, TestResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteReport {
    pub name: String,
    pub description: String,
    #[serde(rename = "clientVersions")]
    pub client_versions: BTreeMap<String, String>,
    #[serde(rename = "simLog")]
    pub sim_log: String,
    #[serde(rename = "testCases")]
    pub test_cases: BTreeMap<TestID, TestCaseReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCaseReport {
    pub name: String,
    pub description: String,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    #[serde(rename = "summaryResult")]
    pub summary_result: TestResult,
    #[serde(rename = "clientInfo")]
    pub client_info: BTreeMap<String, ClientInfoReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfoReport {
    pub name: String,
    #[serde(rename = "logFile")]
    pub log_file: String,
}

impl SuiteReport {
    pub fn from_suite(suite: &Suite) -> Self {
        let mut client_versions = BTreeMap::new();
        let mut test_cases = BTreeMap::new();

        for test in suite.tests.values() {
            let mut client_info = BTreeMap::new();
            for node in test.nodes.values() {
                client_versions.insert(node.client_type.clone(), node.version.clone());
                let log_file = node
                    .log_file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                client_info.insert(
                    node.id.clone(),
                    ClientInfoReport {
                        name: node.client_type.clone(),
                        log_file,
                    },
                );
            }
            test_cases.insert(
                test.id,
                TestCaseReport {
                    name: test.name.clone(),
                    description: test.description.clone(),
                    start: test.started,
                    end: test.ended,
                    summary_result: test.result.clone().unwrap_or_else(|| TestResult {
                        pass: false,
                        details: "test did not report a result".to_string(),
                    }),
                    client_info,
                },
            );
        }

        SuiteReport {
            name: suite.name.clone(),
            description: suite.description.clone(),
            client_versions,
            sim_log: suite.sim_log.clone(),
            test_cases,
        }
    }
}

/// Serialize a suite report under the results root. Write-then-rename so a
/// crash mid-write never leaves a truncated report behind.
pub fn write_suite(root: &Path, suite_id: SuiteID, report: &SuiteReport) -> io::Result<PathBuf> {
    fs::create_dir_all(root)?;
    let file = root.join(format!("{}-{}.json", Utc::now().timestamp_millis(), suite_id));
    let tmp = file.with_extension("tmp");

    let body = serde_json::to_vec_pretty(report)?;
    fs::write(&tmp, body)?;
    fs::rename(&tmp, &file)?;
    Ok(file)
}

pub fn read_suite(path: &Path) -> io::Result<SuiteReport> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}
