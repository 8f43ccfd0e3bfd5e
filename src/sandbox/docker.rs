//! Docker sandbox provider over the bollard API.
//!
//! Containers are addressed by name: every call re-resolves the container
//! through a list-then-find so an externally removed sandbox surfaces as a
//! clean error rather than a stale handle.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::{shell_quote, ExecOutput, Sandbox, SandboxProvider, INSTALL_TIMEOUT};
use crate::util::new_id;

/// Project root inside the container: the sandbox user's home directory.
const PROJECT_ROOT: &str = "/root";

pub struct DockerProvider {
    docker: Docker,
    image: String,
}

impl DockerProvider {
    /// Connect to the Docker daemon via the unix socket.
    pub fn connect(image: impl Into<String>) -> Result<Self> {
        let docker =
            Docker::connect_with_socket_defaults().context("Failed to connect Docker daemon")?;
        Ok(Self {
            docker,
            image: image.into(),
        })
    }

    async fn pull_image(&self) {
        let mut pull = self.docker.create_image(
            Some(CreateImageOptions::<String> {
                from_image: self.image.clone(),
                ..Default::default()
            }),
            None,
            None,
        );
        // Pull failures are tolerated: the image may already exist locally.
        while let Some(step) = pull.next().await {
            if let Err(e) = step {
                debug!(error = %e, image = %self.image, "Image pull step failed");
                break;
            }
        }
    }
}

#[async_trait]
impl SandboxProvider for DockerProvider {
    fn name(&self) -> &str {
        "docker"
    }

    async fn provision(
        &self,
        project_id: &str,
        env: &[(String, String)],
    ) -> Result<Box<dyn Sandbox>> {
        self.pull_image().await;

        let name = format!("turbobackend-sandbox-{}-{}", project_id, new_id());
        let env_strings: Vec<String> = env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();

        let config = Config {
            image: Some(self.image.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            env: Some(env_strings),
            working_dir: Some(PROJECT_ROOT.to_string()),
            tty: Some(false),
            host_config: Some(HostConfig {
                auto_remove: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .context("Failed to create sandbox container")?;
        self.docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start sandbox container")?;

        let sandbox = DockerSandbox {
            docker: self.docker.clone(),
            name: name.clone(),
        };

        // Tools later phases rely on: file-tree listing and the object-store CLI.
        let install = sandbox
            .exec_with_timeout(
                "apt-get update -qq && apt-get install -y -qq tree awscli",
                INSTALL_TIMEOUT,
            )
            .await?;
        if !install.success() {
            warn!(
                container = %name,
                stderr = %crate::util::truncate(&install.stderr, 300),
                "Sandbox tool installation failed"
            );
        }

        info!(container = %name, "Provisioned sandbox");
        Ok(Box::new(sandbox))
    }
}

pub struct DockerSandbox {
    docker: Docker,
    name: String,
}

impl DockerSandbox {
    /// Re-resolve the container id by name. The sandbox is externally owned;
    /// it can disappear between calls.
    async fn resolve(&self) -> Result<String> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![self.name.clone()]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .context("Failed to list containers")?;

        containers
            .into_iter()
            .find_map(|c| c.id)
            .ok_or_else(|| anyhow::anyhow!("Sandbox {} no longer exists", self.name))
    }

    async fn run(
        &self,
        command: &str,
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<ExecOutput> {
        let container_id = self.resolve().await?;

        let exec = self
            .docker
            .create_exec(
                &container_id,
                CreateExecOptions::<String> {
                    cmd: Some(vec![
                        "sh".to_string(),
                        "-lc".to_string(),
                        command.to_string(),
                    ]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    attach_stdin: Some(stdin.is_some()),
                    working_dir: Some(PROJECT_ROOT.to_string()),
                    ..Default::default()
                },
            )
            .await
            .context("Failed to create exec")?;

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .context("Failed to start exec")?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached {
            mut output,
            mut input,
        } = started
        {
            if let Some(bytes) = stdin {
                input.write_all(bytes).await.ok();
                input.shutdown().await.ok();
            }
            drop(input);

            let drain = async {
                while let Some(Ok(frame)) = output.next().await {
                    match frame {
                        LogOutput::StdOut { message } => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        LogOutput::StdErr { message } => {
                            stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        _ => {}
                    }
                }
            };
            if tokio::time::timeout(timeout, drain).await.is_err() {
                anyhow::bail!(
                    "Command timed out after {}s: {}",
                    timeout.as_secs(),
                    crate::util::truncate(command, 120)
                );
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .context("Failed to inspect exec")?;

        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            stdout,
            stderr,
        })
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn id(&self) -> &str {
        &self.name
    }

    async fn exec_with_timeout(&self, command: &str, timeout: Duration) -> Result<ExecOutput> {
        self.run(command, None, timeout).await
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let quoted = shell_quote(path);
        let command = format!(
            "mkdir -p \"$(dirname {})\" && cat > {}",
            quoted, quoted
        );
        let out = self
            .run(&command, Some(content.as_bytes()), super::EXEC_TIMEOUT)
            .await?;
        if !out.success() {
            anyhow::bail!("Failed to write {}: {}", path, out.stderr.trim());
        }
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        let out = self.exec(&format!("cat {}", shell_quote(path))).await?;
        if !out.success() {
            anyhow::bail!("Failed to read {}: {}", path, out.stderr.trim());
        }
        Ok(out.stdout)
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        let out = self.exec(&format!("rm -rf {}", shell_quote(path))).await?;
        if !out.success() {
            anyhow::bail!("Failed to delete {}: {}", path, out.stderr.trim());
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let container_id = self.resolve().await?;
        self.docker
            .stop_container(&container_id, None)
            .await
            .context("Failed to stop sandbox")?;
        self.docker
            .remove_container(
                &container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .context("Failed to remove sandbox")?;
        info!(container = %self.name, "Sandbox torn down");
        Ok(())
    }
}
