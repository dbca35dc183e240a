/// Docker Backend - Long-Lived Test Instances
///
/// **Core Responsibility:**
/// Implement `ExecutionBackend` on top of the local Docker daemon.
///
/// **Instance Rules:**
/// 1. Pulls the image if it is not cached
/// 2. Creates a named container kept alive with `sleep infinity`
/// 3. Files are delivered as single-entry tar uploads
/// 4. Commands run through exec with the instance environment
/// 5. Stopping and deleting are separate steps so instances can be retained
use crate::backend::{ExecutionBackend, InstanceConfig, InstanceHandle, InstanceStatus, RawExecution};
use crate::error::BackendError;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::path::Path;
use testbox_common::types::Environment;
use tracing::{debug, info, warn};

/// Grace period before docker kills a stopping container
const STOP_GRACE_SECS: i64 = 10;

pub struct DockerBackend {
    docker: Docker,
}

impl DockerBackend {
    pub fn connect() -> Result<Self, BackendError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    /// Ensure Docker image is available (pull if needed)
    async fn ensure_image(&self, image: &str) -> Result<(), BackendError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!("Image cache hit: {}", image);
            return Ok(());
        }

        warn!("Image cache miss: {} (pulling now)", image);

        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result?;
        }

        info!("Image pulled successfully: {}", image);
        Ok(())
    }
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }
    )
}

fn not_found_or(name: &str, err: bollard::errors::Error) -> BackendError {
    if is_not_found(&err) {
        BackendError::NotFound(name.to_string())
    } else {
        BackendError::Docker(err)
    }
}

/// Tar archive holding one file, named after the last path component.
fn single_file_archive(file_name: &str, contents: &[u8]) -> Result<Vec<u8>, BackendError> {
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();

    let mut builder = tar::Builder::new(Vec::new());
    builder
        .append_data(&mut header, file_name, contents)
        .map_err(|e| BackendError::Other(format!("could not archive {}: {}", file_name, e)))?;
    builder
        .into_inner()
        .map_err(|e| BackendError::Other(format!("could not archive {}: {}", file_name, e)))
}

#[async_trait]
impl ExecutionBackend for DockerBackend {
    async fn exists(&self, name: &str) -> Result<bool, BackendError> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn status(&self, name: &str) -> Result<InstanceStatus, BackendError> {
        let inspect = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| not_found_or(name, e))?;

        let running = inspect
            .state
            .and_then(|state| state.running)
            .ok_or_else(|| BackendError::Malformed(format!("no state reported for {}", name)))?;

        Ok(if running {
            InstanceStatus::Running
        } else {
            InstanceStatus::Stopped
        })
    }

    #[tracing::instrument(skip(self, config), fields(instance = %config.name, image = %config.image))]
    async fn create(&self, config: &InstanceConfig) -> Result<InstanceHandle, BackendError> {
        self.ensure_image(&config.image).await?;

        let host_config = bollard::models::HostConfig {
            memory: config.memory_limit_mb.map(|mb| (mb as i64) * 1024 * 1024),
            nano_cpus: config.cpu_limit.map(|cpus| (cpus as f64 * 1_000_000_000.0) as i64),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(config.image.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            entrypoint: Some(vec![]),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: config.name.as_str(),
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(options), container_config)
            .await?;
        for warning in &container.warnings {
            warn!(instance = %config.name, "{}", warning);
        }

        info!(container_id = %container.id, "Container created");
        Ok(InstanceHandle::new(config.name.clone()))
    }

    async fn start(&self, handle: &InstanceHandle) -> Result<(), BackendError> {
        self.docker
            .start_container(&handle.name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| not_found_or(&handle.name, e))
    }

    async fn stop(&self, handle: &InstanceHandle) -> Result<(), BackendError> {
        self.docker
            .stop_container(&handle.name, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
            .map_err(|e| not_found_or(&handle.name, e))
    }

    async fn delete(&self, handle: &InstanceHandle) -> Result<(), BackendError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(&handle.name, Some(options))
            .await
            .map_err(|e| not_found_or(&handle.name, e))
    }

    async fn put_file(
        &self,
        handle: &InstanceHandle,
        remote_path: &str,
        contents: &[u8],
    ) -> Result<(), BackendError> {
        let path = Path::new(remote_path);
        let (parent, file_name) = match (path.parent(), path.file_name()) {
            (Some(parent), Some(file_name)) => (parent, file_name.to_string_lossy().into_owned()),
            _ => {
                return Err(BackendError::Other(format!(
                    "invalid remote path {}",
                    remote_path
                )))
            }
        };
        let parent = match parent.to_string_lossy().into_owned() {
            p if p.is_empty() => "/".to_string(),
            p => p,
        };

        let archive = single_file_archive(&file_name, contents)?;
        let options = UploadToContainerOptions {
            path: parent,
            ..Default::default()
        };

        self.docker
            .upload_to_container(&handle.name, Some(options), archive.into())
            .await
            .map_err(|e| not_found_or(&handle.name, e))?;

        debug!(instance = %handle.name, remote_path, bytes = contents.len(), "File transferred");
        Ok(())
    }

    async fn execute(
        &self,
        handle: &InstanceHandle,
        argv: &[String],
        env: &Environment,
    ) -> Result<RawExecution, BackendError> {
        let exec_config = CreateExecOptions {
            cmd: Some(argv.to_vec()),
            env: Some(env.dump()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(&handle.name, exec_config)
            .await
            .map_err(|e| not_found_or(&handle.name, e))?;

        let start_config = StartExecOptions {
            detach: false,
            ..Default::default()
        };

        let output = self.docker.start_exec(&exec.id, Some(start_config)).await?;

        let (stdout, stderr) = match output {
            StartExecResults::Attached { mut output, .. } => {
                let mut stdout = Vec::new();
                let mut stderr = Vec::new();
                while let Some(msg) = output.next().await {
                    match msg? {
                        LogOutput::StdOut { message } => stdout.extend_from_slice(&message),
                        LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                        _ => {}
                    }
                }
                (Some(stdout), Some(stderr))
            }
            StartExecResults::Detached => (None, None),
        };

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        debug!(instance = %handle.name, command = ?argv, exit_code = ?inspect.exit_code, "Exec finished");

        Ok(RawExecution {
            exit_code: inspect.exit_code,
            stdout,
            stderr,
        })
    }
}
