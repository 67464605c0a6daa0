// Container backend interface and the Docker driver.
//
// The backend only knows about primitive container and network resources.
// Suites and tests are a lifecycle-manager concern; callers hand the backend
// fully resolved names and ids.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::pin::Pin;

use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, ListContainersOptions,
    LogOutput, LogsOptions, RemoveContainerOptions, UploadToContainerOptions,
    WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::BuildImageOptions;
use bollard::network::{
    ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions,
    InspectNetworkOptions, ListNetworksOptions,
};
use bollard::models::EndpointSettings;
use bollard::Docker;

/// Label attached to every container and network the host creates, keyed by
/// host instance id. The startup sweep removes anything carrying it.
pub const INSTANCE_LABEL: &str = "hive.instance";

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("image build failed: {0}")]
    Build(String),
    #[error("container {0} is not attached to network {1}")]
    NotAttached(String, String),
    #[error("docker: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

/// A file written into a container before its entrypoint runs.
#[derive(Debug, Clone)]
pub struct FileMount {
    pub container_path: String,
    pub contents: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct ContainerOptions {
    pub image: String,
    pub name: Option<String>,
    /// KEY=VALUE pairs.
    pub env: Vec<String>,
    pub files: Vec<FileMount>,
    /// Tar archives extracted at the container root before start.
    pub tar_archives: Vec<Bytes>,
    /// Networks to attach in addition to the default bridge.
    pub networks: Vec<String>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct StartedContainer {
    pub id: String,
    /// Network name to assigned address, always including the bridge.
    pub ip: HashMap<String, IpAddr>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

pub type LogStream = Pin<Box<dyn Stream<Item = Result<Bytes, BackendError>> + Send>>;

/// Container runtime abstraction. All operations are blocking from the
/// caller's point of view; concurrency is managed above this trait.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Build an image from a directory containing a Dockerfile and return
    /// the image id. Idempotent on unchanged inputs unless `nocache` is set.
    async fn build_image(
        &self,
        tag: &str,
        context: &Path,
        nocache: bool,
    ) -> Result<String, BackendError>;

    /// Read a single file out of an image without running it. `None` when
    /// the file does not exist.
    async fn image_file(&self, image: &str, path: &str) -> Result<Option<Vec<u8>>, BackendError>;

    /// Create a container, inject files, attach networks, start it, and
    /// report its addresses.
    async fn start_container(
        &self,
        opts: ContainerOptions,
    ) -> Result<StartedContainer, BackendError>;

    /// Force-kill and remove. Succeeds when the container has already
    /// exited or was never created.
    async fn stop_container(&self, id: &str) -> Result<(), BackendError>;

    async fn inspect_ip(&self, id: &str, network: &str) -> Result<IpAddr, BackendError>;

    async fn create_network(&self, name: &str) -> Result<(), BackendError>;

    async fn remove_network(&self, name: &str) -> Result<(), BackendError>;

    async fn connect_network(&self, network: &str, container: &str) -> Result<(), BackendError>;

    async fn disconnect_network(&self, network: &str, container: &str)
        -> Result<(), BackendError>;

    async fn exec(
        &self,
        id: &str,
        cmd: Vec<String>,
        user: Option<String>,
        privileged: bool,
    ) -> Result<ExecOutput, BackendError>;

    /// Stream combined stdout/stderr. The stream ends when the container
    /// exits or is removed.
    async fn follow_logs(&self, id: &str) -> Result<LogStream, BackendError>;

    /// Block until the container exits and return its exit code.
    async fn wait_container(&self, id: &str) -> Result<i64, BackendError>;

    /// Gateway address of a network, used to build the control-plane URL
    /// that containers can reach.
    async fn network_gateway(&self, network: &str) -> Result<IpAddr, BackendError>;

    /// Remove every container and network labelled as belonging to a hive
    /// host. Returns (containers, networks) removed.
    async fn prune_instances(&self) -> Result<(usize, usize), BackendError>;
}

// ============================================================================
// Docker driver
// ============================================================================

pub struct DockerBackend {
    docker: Docker,
    instance: String,
}

impl DockerBackend {
    /// Connect to the daemon and verify it responds. `endpoint` accepts
    /// unix:// and tcp:// URLs; anything else falls back to the platform
    /// defaults.
    pub async fn connect(endpoint: &str, instance: String) -> Result<Self, BackendError> {
        let docker = if endpoint.starts_with("unix://") {
            Docker::connect_with_unix(endpoint, 120, bollard::API_DEFAULT_VERSION)?
        } else if endpoint.starts_with("tcp://") || endpoint.starts_with("http://") {
            Docker::connect_with_http(endpoint, 120, bollard::API_DEFAULT_VERSION)?
        } else {
            Docker::connect_with_local_defaults()?
        };

        docker.version().await?;
        tracing::info!("connected to container runtime at {}", endpoint);
        Ok(Self { docker, instance })
    }

    fn instance_labels(&self, extra: HashMap<String, String>) -> HashMap<String, String> {
        let mut labels = extra;
        labels.insert(INSTANCE_LABEL.to_string(), self.instance.clone());
        labels
    }

    async fn container_ips(&self, id: &str) -> Result<HashMap<String, IpAddr>, BackendError> {
        let info = self.docker.inspect_container(id, None).await?;
        let mut out = HashMap::new();
        let networks = info
            .network_settings
            .and_then(|s| s.networks)
            .unwrap_or_default();
        for (name, endpoint) in networks {
            if let Some(addr) = endpoint.ip_address.as_deref().filter(|a| !a.is_empty()) {
                if let Ok(ip) = addr.parse() {
                    out.insert(name, ip);
                }
            }
        }
        Ok(out)
    }

    async fn upload_archive(&self, id: &str, tar: Bytes) -> Result<(), BackendError> {
        let options = UploadToContainerOptions {
            path: "/".to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(id, Some(options), tar)
            .await?;
        Ok(())
    }

    /// Everything between create and the first successful inspect. Split out
    /// so a failure can roll the container back in one place.
    async fn finish_start(
        &self,
        id: &str,
        opts: &ContainerOptions,
    ) -> Result<HashMap<String, IpAddr>, BackendError> {
        if !opts.files.is_empty() {
            let tar = archive_files(&opts.files)?;
            self.upload_archive(id, tar).await?;
        }
        for archive in &opts.tar_archives {
            self.upload_archive(id, archive.clone()).await?;
        }
        for network in &opts.networks {
            self.connect_network(network, id).await?;
        }
        self.docker.start_container::<String>(id, None).await?;
        self.container_ips(id).await
    }
}

#[async_trait]
impl ContainerBackend for DockerBackend {
    async fn build_image(
        &self,
        tag: &str,
        context: &Path,
        nocache: bool,
    ) -> Result<String, BackendError> {
        let tar = archive_dir(context)?;
        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: tag.to_string(),
            nocache,
            rm: true,
            ..Default::default()
        };

        let mut output = self.docker.build_image(options, None, Some(tar));
        let mut tail = String::new();
        while let Some(msg) = output.next().await {
            let info = msg?;
            if let Some(line) = info.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    tracing::debug!("build {}: {}", tag, line);
                    tail = line.to_string();
                }
            }
            if let Some(err) = info.error {
                return Err(BackendError::Build(format!("{} ({})", err.trim(), tail)));
            }
        }

        let inspect = self.docker.inspect_image(tag).await?;
        Ok(inspect.id.unwrap_or_else(|| tag.to_string()))
    }

    async fn image_file(&self, image: &str, path: &str) -> Result<Option<Vec<u8>>, BackendError> {
        // A created-but-never-started container is enough to read files out
        // of the image filesystem.
        let config = Config::<String> {
            image: Some(image.to_string()),
            labels: Some(self.instance_labels(HashMap::new())),
            ..Default::default()
        };
        let id = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await?
            .id;

        let result = async {
            let options = DownloadFromContainerOptions {
                path: path.to_string(),
            };
            let mut stream = self.docker.download_from_container(&id, Some(options));
            let mut buf = Vec::new();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => buf.extend_from_slice(&bytes),
                    Err(bollard::errors::Error::DockerResponseServerError {
                        status_code: 404,
                        ..
                    }) => return Ok(None),
                    Err(err) => return Err(BackendError::from(err)),
                }
            }
            let mut archive = tar::Archive::new(buf.as_slice());
            for entry in archive.entries()? {
                let mut entry = entry?;
                if entry.header().entry_type().is_file() {
                    let mut contents = Vec::new();
                    std::io::copy(&mut entry, &mut contents)?;
                    return Ok(Some(contents));
                }
            }
            Ok(None)
        }
        .await;

        let _ = self
            .docker
            .remove_container(
                &id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
        result
    }

    async fn start_container(
        &self,
        opts: ContainerOptions,
    ) -> Result<StartedContainer, BackendError> {
        let name = opts
            .name
            .clone()
            .unwrap_or_else(|| format!("hive-{}", uuid::Uuid::new_v4().simple()));

        let config = Config::<String> {
            image: Some(opts.image.clone()),
            env: Some(opts.env.clone()),
            labels: Some(self.instance_labels(opts.labels.clone())),
            ..Default::default()
        };
        let id = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name,
                    platform: None,
                }),
                config,
            )
            .await?
            .id;

        match self.finish_start(&id, &opts).await {
            Ok(ip) => Ok(StartedContainer { id, ip }),
            Err(err) => {
                let _ = self.stop_container(&id).await;
                Err(err)
            }
        }
    }

    async fn stop_container(&self, id: &str) -> Result<(), BackendError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // Already gone, or removal already in progress.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404 | 409,
                ..
            }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn inspect_ip(&self, id: &str, network: &str) -> Result<IpAddr, BackendError> {
        self.container_ips(id)
            .await?
            .get(network)
            .copied()
            .ok_or_else(|| BackendError::NotAttached(id.to_string(), network.to_string()))
    }

    async fn create_network(&self, name: &str) -> Result<(), BackendError> {
        let options = CreateNetworkOptions {
            name: name.to_string(),
            check_duplicate: true,
            labels: self.instance_labels(HashMap::new()),
            ..Default::default()
        };
        self.docker.create_network(options).await?;
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<(), BackendError> {
        match self.docker.remove_network(name).await {
            Ok(())
            | Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn connect_network(&self, network: &str, container: &str) -> Result<(), BackendError> {
        let options = ConnectNetworkOptions {
            container: container.to_string(),
            endpoint_config: EndpointSettings::default(),
        };
        self.docker.connect_network(network, options).await?;
        Ok(())
    }

    async fn disconnect_network(
        &self,
        network: &str,
        container: &str,
    ) -> Result<(), BackendError> {
        let options = DisconnectNetworkOptions {
            container: container.to_string(),
            force: true,
        };
        self.docker.disconnect_network(network, options).await?;
        Ok(())
    }

    async fn exec(
        &self,
        id: &str,
        cmd: Vec<String>,
        user: Option<String>,
        privileged: bool,
    ) -> Result<ExecOutput, BackendError> {
        let options = CreateExecOptions::<String> {
            cmd: Some(cmd),
            user,
            privileged: Some(privileged),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self.docker.create_exec(id, options).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        if let StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(&exec.id, None).await?
        {
            while let Some(chunk) = output.next().await {
                match chunk? {
                    LogOutput::StdOut { message } => stdout.extend_from_slice(&message),
                    LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                    _ => {}
                }
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: inspect.exit_code.unwrap_or(0),
        })
    }

    async fn follow_logs(&self, id: &str) -> Result<LogStream, BackendError> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            tail: "all".to_string(),
            ..Default::default()
        };
        let stream = self.docker.logs(id, Some(options)).map(|chunk| {
            chunk
                .map(LogOutput::into_bytes)
                .map_err(BackendError::from)
        });
        Ok(Box::pin(stream))
    }

    async fn wait_container(&self, id: &str) -> Result<i64, BackendError> {
        let mut stream = self
            .docker
            .wait_container(id, None::<WaitContainerOptions<String>>);
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // A non-zero exit comes back as an error carrying the code.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(err)) => Err(err.into()),
            None => Ok(0),
        }
    }

    async fn network_gateway(&self, network: &str) -> Result<IpAddr, BackendError> {
        let info = self
            .docker
            .inspect_network(network, None::<InspectNetworkOptions<String>>)
            .await?;
        info.ipam
            .and_then(|ipam| ipam.config)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|cfg| cfg.gateway)
            .find_map(|gateway| gateway.parse().ok())
            .ok_or_else(|| {
                BackendError::Other(format!("network {} has no gateway address", network))
            })
    }

    async fn prune_instances(&self) -> Result<(usize, usize), BackendError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![INSTANCE_LABEL.to_string()]);

        let mut removed_containers = 0;
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters: filters.clone(),
                ..Default::default()
            }))
            .await?;
        for container in containers {
            if let Some(id) = container.id {
                match self.stop_container(&id).await {
                    Ok(()) => removed_containers += 1,
                    Err(err) => tracing::error!("failed to remove stale container {}: {}", id, err),
                }
            }
        }

        let mut removed_networks = 0;
        let networks = self
            .docker
            .list_networks(Some(ListNetworksOptions { filters }))
            .await?;
        for network in networks {
            if let Some(name) = network.name {
                match self.remove_network(&name).await {
                    Ok(()) => removed_networks += 1,
                    Err(err) => tracing::error!("failed to remove stale network {}: {}", name, err),
                }
            }
        }

        Ok((removed_containers, removed_networks))
    }
}

/// Pack a directory into an uncompressed tar stream for the image builder.
fn archive_dir(dir: &Path) -> Result<Bytes, BackendError> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.append_dir_all(".", dir)?;
    let buf = builder.into_inner()?;
    Ok(Bytes::from(buf))
}

/// Pack individual file mounts into a tar stream rooted at `/`.
fn archive_files(files: &[FileMount]) -> Result<Bytes, BackendError> {
    let mut builder = tar::Builder::new(Vec::new());
    for file in files {
        let path = file.container_path.trim_start_matches('/');
        let mut header = tar::Header::new_gnu();
        header.set_size(file.contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, file.contents.as_slice())?;
    }
    let buf = builder.into_inner()?;
    Ok(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_archive_contains_all_mounts() {
        let files = vec![
            FileMount {
                container_path: "/genesis.json".to_string(),
                contents: b"{}".to_vec(),
            },
            FileMount {
                container_path: "/keys/key1".to_string(),
                contents: b"secret".to_vec(),
            },
        ];
        let tar = archive_files(&files).unwrap();

        let mut archive = tar::Archive::new(tar.as_ref());
        let paths: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert_eq!(paths, vec!["genesis.json", "keys/key1"]);
    }

    #[test]
    fn dir_archive_includes_dockerfile() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM scratch\n").unwrap();
        let tar = archive_dir(dir.path()).unwrap();

        let mut archive = tar::Archive::new(tar.as_ref());
        let found = archive
            .entries()
            .unwrap()
            .any(|e| e.unwrap().path().unwrap().ends_with("Dockerfile"));
        assert!(found);
    }
}
