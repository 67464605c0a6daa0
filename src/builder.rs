// Image builder and client registry.
//
// Client definitions live in direct subdirectories of the clients
// directory; simulator definitions may be nested (ethereum/sync). Every
// directory containing a Dockerfile is one definition. The registry is
// read-only once built.

use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use walkdir::WalkDir;

use crate::container::{BackendError, ContainerBackend};
use crate::types::{ClientDefinition, ClientMetadata, SimulatorDefinition};

/// Build artifact inside client images holding the version string.
const VERSION_FILE: &str = "/version.txt";

pub struct ImageBuilder {
    backend: Arc<dyn ContainerBackend>,
    nocache: Vec<Regex>,
}

impl ImageBuilder {
    pub fn new(backend: Arc<dyn ContainerBackend>, nocache_patterns: &[String]) -> Result<Self, regex::Error> {
        let nocache = nocache_patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { backend, nocache })
    }

    fn force_rebuild(&self, name: &str, tag: &str) -> bool {
        self.nocache
            .iter()
            .any(|re| re.is_match(name) || re.is_match(tag))
    }

    /// Build every selected client image and assemble the registry. An empty
    /// allow-list selects all discovered clients. Build failures are fatal;
    /// a client that cannot be built cannot be tested against.
    pub async fn build_clients(
        &self,
        clients_dir: &Path,
        allow: &[String],
    ) -> Result<HashMap<String, ClientDefinition>, BackendError> {
        let mut registry = HashMap::new();

        for dir in definition_dirs(clients_dir, false) {
            let name = dir
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            if !allow.is_empty() && !allow.iter().any(|a| a == &name) {
                continue;
            }

            let tag = format!("hive/clients/{}", name);
            let nocache = self.force_rebuild(&name, &tag);
            tracing::info!("building client image {} (nocache: {})", tag, nocache);
            self.backend.build_image(&tag, &dir, nocache).await?;

            let version = match self.backend.image_file(&tag, VERSION_FILE).await? {
                Some(raw) => String::from_utf8_lossy(&raw).trim().to_string(),
                None => {
                    tracing::warn!("client {} has no {}", name, VERSION_FILE);
                    String::new()
                }
            };
            let meta = load_metadata(&dir);

            registry.insert(
                name.clone(),
                ClientDefinition {
                    name,
                    version,
                    image: tag,
                    meta,
                },
            );
        }

        Ok(registry)
    }

    /// Build the simulator images whose names match any of the glob
    /// `selectors`. No selectors means every discovered simulator.
    pub async fn build_simulators(
        &self,
        sims_dir: &Path,
        selectors: &[String],
    ) -> Result<Vec<SimulatorDefinition>, BackendError> {
        let mut sims = Vec::new();

        for dir in definition_dirs(sims_dir, true) {
            let name = dir
                .strip_prefix(sims_dir)
                .unwrap_or(&dir)
                .to_string_lossy()
                .replace('\\', "/");
            if !selectors.is_empty()
                && !selectors.iter().any(|s| glob_match::glob_match(s, &name))
            {
                continue;
            }

            let tag = format!("hive/simulators/{}", name);
            let nocache = self.force_rebuild(&name, &tag);
            tracing::info!("building simulator image {} (nocache: {})", tag, nocache);
            self.backend.build_image(&tag, &dir, nocache).await?;
            sims.push(SimulatorDefinition { name, image: tag });
        }

        sims.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(sims)
    }
}

/// Directories under `root` that contain a build context. Clients sit
/// directly below the root; simulators may be nested.
fn definition_dirs(root: &Path, recursive: bool) -> Vec<std::path::PathBuf> {
    let depth = if recursive { usize::MAX } else { 1 };
    let mut dirs: Vec<_> = WalkDir::new(root)
        .min_depth(1)
        .max_depth(depth)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir() && entry.path().join("Dockerfile").is_file())
        .map(|entry| entry.into_path())
        .collect();
    dirs.sort();
    dirs
}

fn load_metadata(dir: &Path) -> ClientMetadata {
    let path = dir.join("hive.yaml");
    match std::fs::read_to_string(&path) {
        Ok(raw) => match serde_yaml::from_str(&raw) {
            Ok(meta) => meta,
            Err(err) => {
                tracing::warn!("ignoring malformed {}: {}", path.display(), err);
                ClientMetadata::default()
            }
        },
        Err(_) => ClientMetadata::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBackend;
    use std::fs;

    fn write_client(root: &Path, name: &str, meta: Option<&str>) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("Dockerfile"), "FROM scratch\n").unwrap();
        if let Some(meta) = meta {
            fs::write(dir.join("hive.yaml"), meta).unwrap();
        }
    }

    #[tokio::test]
    async fn discovers_and_builds_clients() {
        let root = tempfile::tempdir().unwrap();
        write_client(root.path(), "go-ethereum_latest", Some("roles:\n  - eth1\n  - eth1_light\n"));
        write_client(root.path(), "parity_latest", None);
        // No Dockerfile, not a client.
        fs::create_dir_all(root.path().join("README-only")).unwrap();

        let backend = Arc::new(MockBackend::new());
        let builder = ImageBuilder::new(backend.clone(), &[]).unwrap();
        let registry = builder.build_clients(root.path(), &[]).await.unwrap();

        assert_eq!(registry.len(), 2);
        let geth = &registry["go-ethereum_latest"];
        assert_eq!(geth.version, "1.0.0");
        assert_eq!(geth.image, "hive/clients/go-ethereum_latest");
        assert_eq!(geth.meta.roles, vec!["eth1", "eth1_light"]);
        assert_eq!(registry["parity_latest"].meta.roles, vec!["eth1"]);
        assert_eq!(backend.calls("build_image"), 2);
    }

    #[tokio::test]
    async fn client_allow_list_filters_builds() {
        let root = tempfile::tempdir().unwrap();
        write_client(root.path(), "go-ethereum_latest", None);
        write_client(root.path(), "parity_latest", None);

        let backend = Arc::new(MockBackend::new());
        let builder = ImageBuilder::new(backend.clone(), &[]).unwrap();
        let registry = builder
            .build_clients(root.path(), &["parity_latest".to_string()])
            .await
            .unwrap();

        assert_eq!(registry.len(), 1);
        assert!(registry.contains_key("parity_latest"));
        assert_eq!(backend.calls("build_image"), 1);
    }

    #[tokio::test]
    async fn nocache_pattern_forces_rebuild() {
        let root = tempfile::tempdir().unwrap();
        write_client(root.path(), "go-ethereum_latest", None);
        write_client(root.path(), "parity_latest", None);

        let backend = Arc::new(MockBackend::new());
        let builder = ImageBuilder::new(backend.clone(), &["go-ethereum".to_string()]).unwrap();
        builder.build_clients(root.path(), &[]).await.unwrap();

        assert_eq!(backend.build_nocache("hive/clients/go-ethereum_latest"), Some(true));
        assert_eq!(backend.build_nocache("hive/clients/parity_latest"), Some(false));
    }

    #[tokio::test]
    async fn simulators_match_by_glob_and_may_nest() {
        let root = tempfile::tempdir().unwrap();
        write_client(root.path(), "smoke", None);
        let nested = root.path().join("ethereum");
        write_client(&nested, "sync", None);

        let backend = Arc::new(MockBackend::new());
        let builder = ImageBuilder::new(backend.clone(), &[]).unwrap();

        let all = builder.build_simulators(root.path(), &[]).await.unwrap();
        let names: Vec<_> = all.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["ethereum/sync", "smoke"]);

        let filtered = builder
            .build_simulators(root.path(), &["smoke".to_string()])
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].image, "hive/simulators/smoke");

        let nested = builder
            .build_simulators(root.path(), &["ethereum/*".to_string()])
            .await
            .unwrap();
        assert_eq!(nested.len(), 1);
        assert_eq!(nested[0].name, "ethereum/sync");
    }
}
