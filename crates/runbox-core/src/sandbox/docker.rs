// src/sandbox/docker.rs
use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions as BollardCreateContainerOptionsQuery,
    CreateImageOptions as BollardCreateImageOptionsQuery,
    LogsOptions as BollardLogsOptionsQuery,
    RemoveContainerOptions as BollardRemoveContainerOptionsQuery,
    StartContainerOptions as BollardStartContainerOptionsQuery,
    WaitContainerOptions as BollardWaitContainerOptionsQuery,
};
use bollard::Docker;
use futures_util::future::FutureExt;
use futures_util::stream::StreamExt;
use tokio::sync::mpsc;

use super::{LaunchSpec, OutputChunk, OutputStream, Sandbox, SandboxRun, CONTAINER_WORKDIR};
use crate::errors::SandboxError;

const OUTPUT_CHANNEL_CAPACITY: usize = 256;

pub struct DockerSandbox {
    docker: Docker,
    pull_images: bool,
}

impl DockerSandbox {
    pub fn new(pull_images: bool) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            docker,
            pull_images,
        })
    }

    /// Checks that the daemon answers.
    pub async fn ping(&self) -> Result<(), SandboxError> {
        self.docker.ping().await?;
        Ok(())
    }

    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        log::info!("Pulling image {}", image);
        let options = Some(BollardCreateImageOptionsQuery {
            from_image: Some(image.to_string()),
            ..Default::default()
        });
        let mut pull_stream = self.docker.create_image(options, None, None);
        while let Some(progress) = pull_stream.next().await {
            progress?;
        }
        Ok(())
    }
}

fn is_not_found(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl Sandbox for DockerSandbox {
    async fn launch(&self, spec: &LaunchSpec) -> Result<SandboxRun, SandboxError> {
        if self.pull_images {
            self.ensure_image(&spec.image).await?;
        }

        let workspace = spec.workspace.to_str().ok_or_else(|| {
            SandboxError::LaunchFailed(format!(
                "workspace path {} is not valid UTF-8",
                spec.workspace.display()
            ))
        })?;

        let options = Some(BollardCreateContainerOptionsQuery {
            name: Some(spec.container_name.clone()),
            ..Default::default()
        });

        let config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                spec.script.clone(),
            ]),
            env: Some(spec.env.clone()),
            working_dir: Some(CONTAINER_WORKDIR.to_string()),
            host_config: Some(HostConfig {
                binds: Some(vec![format!("{}:{}", workspace, CONTAINER_WORKDIR)]),
                memory: Some(spec.memory_limit as i64),
                nano_cpus: Some(spec.nano_cpus),
                ..Default::default()
            }),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        self.docker.create_container(options, config).await?;
        self.docker
            .start_container(
                &spec.container_name,
                None::<BollardStartContainerOptionsQuery>,
            )
            .await?;
        log::debug!("Started container {} ({})", spec.container_name, spec.image);

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let docker = self.docker.clone();
        let name = spec.container_name.clone();
        tokio::spawn(async move {
            let mut logs = docker.logs(
                &name,
                Some(BollardLogsOptionsQuery {
                    follow: true,
                    stdout: true,
                    stderr: true,
                    ..Default::default()
                }),
            );
            while let Some(item) = logs.next().await {
                let chunk = match item {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        OutputChunk {
                            stream: OutputStream::Stdout,
                            bytes: message.to_vec(),
                        }
                    }
                    Ok(LogOutput::StdErr { message }) => OutputChunk {
                        stream: OutputStream::Stderr,
                        bytes: message.to_vec(),
                    },
                    Ok(_) => continue,
                    Err(e) => {
                        log::debug!("Log stream for {} ended: {}", name, e);
                        break;
                    }
                };
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
        });

        let docker = self.docker.clone();
        let name = spec.container_name.clone();
        let exit = async move {
            let mut wait =
                docker.wait_container(&name, None::<BollardWaitContainerOptionsQuery>);
            match wait.next().await {
                Some(Ok(response)) => Ok(response.status_code),
                // Non-zero exits are reported as errors by the client.
                Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
                Some(Err(e)) => Err(SandboxError::BollardError(e)),
                None => Err(SandboxError::MissingExitStatus),
            }
        }
        .boxed();

        Ok(SandboxRun { output: rx, exit })
    }

    async fn force_remove(&self, container_name: &str) -> Result<(), SandboxError> {
        let options = Some(BollardRemoveContainerOptionsQuery {
            force: true,
            ..Default::default()
        });
        match self.docker.remove_container(container_name, options).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
