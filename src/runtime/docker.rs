use super::{ComposeStack, ContainerRuntime};
use crate::error::RuntimeError;
use crate::types::ContainerDescriptor;
use async_trait::async_trait;
use bollard::container::{
    InspectContainerOptions, ListContainersOptions, RemoveContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use log::{debug, info};
use std::collections::HashMap;
use std::process::Stdio;
use tokio::process::Command;

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> anyhow::Result<Self> {
        // Connect to the local Docker daemon using default settings.
        // This handles unix socket on Linux.
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn inspect(&self, name: &str) -> Result<serde_json::Value, RuntimeError> {
        let detail = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_error("inspect", name, e))?;
        serde_json::to_value(detail).map_err(|e| RuntimeError::unavailable("inspect", e))
    }

    async fn pull(&self, image: &str) -> Result<(), RuntimeError> {
        let (from_image, tag) = split_image_reference(image);
        info!("Pulling {}:{}", from_image, tag);
        let opts = CreateImageOptions {
            from_image,
            tag,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(opts), None, None);
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(progress) => {
                    if let Some(error) = progress.error {
                        return Err(RuntimeError::unavailable(format!("pull {image}"), error));
                    }
                    if let Some(status) = progress.status {
                        debug!("{}: {}", image, status);
                    }
                }
                Err(e) => return Err(map_error("pull", image, e)),
            }
        }
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .stop_container(name, None::<StopContainerOptions>)
            .await
        {
            Ok(()) => Ok(()),
            // Already stopped.
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(map_error("stop", name, e)),
        }
    }

    async fn remove(&self, name: &str, purge_volumes: bool) -> Result<(), RuntimeError> {
        let opts = RemoveContainerOptions {
            v: purge_volumes,
            ..Default::default()
        };
        self.docker
            .remove_container(name, Some(opts))
            .await
            .map_err(|e| map_error("remove", name, e))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ContainerDescriptor>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![format!("^{prefix}.+$")]);
        let opts = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(opts))
            .await
            .map_err(|e| map_error("list", prefix, e))?;

        let mut found = Vec::new();
        for c in containers {
            let name = c
                .names
                .as_ref()
                .and_then(|n| n.first())
                .map(|n| n.trim_start_matches('/').to_string());
            let (Some(name), Some(image)) = (name, c.image) else {
                continue;
            };
            // The daemon's name filter is a regex search, so re-check the prefix.
            if name.starts_with(prefix) {
                found.push(ContainerDescriptor::new(name, image));
            }
        }
        Ok(found)
    }

    async fn compose_up(&self, stack: &ComposeStack) -> Result<(), RuntimeError> {
        let mut cmd = Command::new("docker");
        cmd.arg("compose");
        for file in &stack.files {
            cmd.arg("-f").arg(file);
        }
        cmd.arg("--env-file")
            .arg(&stack.env_file)
            .args(["up", "-d"])
            .stdin(Stdio::null())
            .kill_on_drop(true);

        debug!("Running {:?}", cmd);
        let status = cmd
            .status()
            .await
            .map_err(|e| RuntimeError::unavailable("compose up", e))?;
        if status.success() {
            Ok(())
        } else {
            Err(RuntimeError::unavailable(
                "compose up",
                format!("docker compose exited with {status}"),
            ))
        }
    }
}

fn map_error(op: &str, subject: &str, e: BollardError) -> RuntimeError {
    match e {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(subject.to_string()),
        other => RuntimeError::unavailable(format!("{op} {subject}"), other),
    }
}

/// Splits an image reference into the `fromImage` and `tag` parameters of
/// the pull API.  A missing tag means `latest`; digests stay in the image.
fn split_image_reference(image: &str) -> (String, String) {
    if image.contains('@') {
        return (image.to_string(), String::new());
    }
    let last_segment = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[last_segment..].rfind(':') {
        Some(i) => {
            let split = last_segment + i;
            (image[..split].to_string(), image[split + 1..].to_string())
        }
        None => (image.to_string(), "latest".to_string()),
    }
}
