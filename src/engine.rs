//! Serialized façade over the container engine. Every call funnels
//! through a single `mpsc` consumer loop, so that concurrent rollouts
//! never issue overlapping inspect/create calls against the engine
//! socket. `bollard`'s `DockerResponseServerError` with status 404 is
//! normalized so callers can treat "already gone" as success where
//! that's the right behavior.
//!
//! The daemon depends on the engine through the [`Engine`] trait rather
//! than the concrete [`EngineClient`], the same seam `Registry` and
//! `ConfigWatcher` use, so reconciliation logic can be exercised against
//! an in-memory fake in tests instead of a real Docker socket.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::image::{CreateImageOptions, ListImagesOptions};
use bollard::models::{ContainerSummary, ImageSummary};
use bollard::service::ContainerInspectResponse;
use bollard::Docker;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};

use crate::error::{is_not_found, Error, ErrorKind};

#[async_trait]
pub trait Engine: Send + Sync {
    async fn inspect_container(&self, name: &str) -> Result<ContainerInspectResponse, Error>;
    async fn inspect_image(&self, reference: &str) -> Result<(), Error>;
    async fn create_container(&self, name: String, config: Config<String>) -> Result<(), Error>;
    async fn start_container(&self, name: &str) -> Result<(), Error>;
    async fn stop_container(&self, name: &str) -> Result<(), Error>;
    async fn remove_container(&self, name: &str) -> Result<(), Error>;
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, Error>;
    async fn list_images(&self) -> Result<Vec<ImageSummary>, Error>;
    async fn remove_image(&self, reference: &str) -> Result<(), Error>;

    /// Pulls `image:tag` if not already present locally, then confirms
    /// the pull by inspecting the image once the stream completes.
    async fn pull_image(&self, image: &str, tag: &str, registry: Option<&str>) -> Result<(), Error>;
}

type BoxedOp = Box<dyn FnOnce(Arc<Docker>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// Thin, cloneable handle; the actual `Docker` connection and the
/// consumer task live behind the queue.
#[derive(Clone)]
pub struct EngineClient {
    sender: mpsc::Sender<BoxedOp>,
}

impl EngineClient {
    pub fn connect() -> Result<Self, Error> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::source(ErrorKind::EngineTransient, e))?;
        Ok(Self::spawn(Arc::new(docker)))
    }

    fn spawn(docker: Arc<Docker>) -> Self {
        let (sender, mut receiver) = mpsc::channel::<BoxedOp>(256);

        tokio::spawn(async move {
            while let Some(op) = receiver.recv().await {
                op(docker.clone()).await;
            }
        });

        Self { sender }
    }

    #[cfg(test)]
    pub fn with_docker(docker: Docker) -> Self {
        Self::spawn(Arc::new(docker))
    }

    async fn call<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce(Arc<Docker>) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let op: BoxedOp = Box::new(move |docker| {
            Box::pin(async move {
                let result = f(docker).await;
                let _ = tx.send(result);
            })
        });
        // The engine queue never drops pending work; if the consumer task
        // has died the caller deadlocking on `rx` would be worse, so a
        // send failure degrades to a single best-effort retry path via
        // the caller observing a closed `rx`.
        let _ = self.sender.send(op).await;
        rx.await.expect("engine consumer task should not exit while handles are live")
    }

}

#[async_trait]
impl Engine for EngineClient {
    async fn inspect_container(&self, name: &str) -> Result<ContainerInspectResponse, Error> {
        let name = name.to_string();
        self.call(move |docker| async move { docker.inspect_container(&name, None).await })
            .await
            .map_err(Error::from)
    }

    async fn inspect_image(&self, reference: &str) -> Result<(), Error> {
        let reference = reference.to_string();
        self.call(move |docker| async move { docker.inspect_image(&reference).await })
            .await
            .map(|_| ())
            .map_err(Error::from)
    }

    async fn create_container(&self, name: String, config: Config<String>) -> Result<(), Error> {
        self.call(move |docker| async move {
            docker
                .create_container(Some(CreateContainerOptions { name, platform: None }), config)
                .await
                .map(|_| ())
        })
        .await
        .map_err(Error::from)
    }

    async fn start_container(&self, name: &str) -> Result<(), Error> {
        let name = name.to_string();
        self.call(
            move |docker| async move { docker.start_container(&name, None::<StartContainerOptions<String>>).await },
        )
        .await
        .map_err(Error::from)
    }

    async fn stop_container(&self, name: &str) -> Result<(), Error> {
        let name = name.to_string();
        match self
            .call(move |docker| async move {
                docker
                    .stop_container(&name, Some(StopContainerOptions { t: 10 }))
                    .await
            })
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(Error::from(err)),
        }
    }

    async fn remove_container(&self, name: &str) -> Result<(), Error> {
        let name = name.to_string();
        match self
            .call(move |docker| async move {
                docker
                    .remove_container(
                        &name,
                        Some(RemoveContainerOptions {
                            force: true,
                            ..Default::default()
                        }),
                    )
                    .await
            })
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(Error::from(err)),
        }
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, Error> {
        self.call(move |docker| async move {
            docker
                .list_containers(Some(ListContainersOptions::<String> {
                    all,
                    ..Default::default()
                }))
                .await
        })
        .await
        .map_err(Error::from)
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>, Error> {
        self.call(move |docker| async move {
            docker
                .list_images(Some(ListImagesOptions::<String> {
                    all: false,
                    ..Default::default()
                }))
                .await
        })
        .await
        .map_err(Error::from)
    }

    async fn remove_image(&self, reference: &str) -> Result<(), Error> {
        let reference = reference.to_string();
        match self
            .call(move |docker| async move { docker.remove_image(&reference, None, None).await })
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(Error::from(err)),
        }
    }

    async fn pull_image(&self, image: &str, tag: &str, registry: Option<&str>) -> Result<(), Error> {
        let reference = format!("{image}:{tag}");
        if Engine::inspect_image(self, &reference).await.is_ok() {
            return Ok(());
        }

        let from_image = match registry {
            Some(registry) => format!("{registry}/{image}"),
            None => image.to_string(),
        };
        let tag = tag.to_string();

        self.call(move |docker| async move {
            let mut stream = docker.create_image(
                Some(CreateImageOptions {
                    from_image,
                    tag,
                    ..Default::default()
                }),
                None,
                None,
            );
            while let Some(item) = stream.next().await {
                item?;
            }
            Ok::<(), bollard::errors::Error>(())
        })
        .await
        .map_err(Error::from)?;

        Engine::inspect_image(self, &reference).await
    }
}

/// In-memory [`Engine`] fake: tracks only each container's running state,
/// enough to drive [`crate::container_runner::ContainerRunner`]'s watch
/// loop and [`crate::service_runtime::ServiceRuntime`]'s rollout logic in
/// tests without a Docker socket.
#[cfg(test)]
#[derive(Default)]
pub struct FakeEngine {
    containers: tokio::sync::Mutex<std::collections::HashMap<String, bool>>,
    images: tokio::sync::Mutex<Vec<ImageSummary>>,
}

#[cfg(test)]
impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_running(&self, name: &str, running: bool) {
        self.containers.lock().await.insert(name.to_string(), running);
    }

    pub async fn forget(&self, name: &str) {
        self.containers.lock().await.remove(name);
    }

    pub async fn set_images(&self, images: Vec<ImageSummary>) {
        *self.images.lock().await = images;
    }

    fn inspect_response(running: bool) -> ContainerInspectResponse {
        use bollard::service::{ContainerState, ContainerStateStatusEnum};
        ContainerInspectResponse {
            state: Some(ContainerState {
                status: Some(if running {
                    ContainerStateStatusEnum::RUNNING
                } else {
                    ContainerStateStatusEnum::EXITED
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[cfg(test)]
#[async_trait]
impl Engine for FakeEngine {
    async fn inspect_container(&self, name: &str) -> Result<ContainerInspectResponse, Error> {
        match self.containers.lock().await.get(name) {
            Some(running) => Ok(Self::inspect_response(*running)),
            None => Err(Error::from_kind(ErrorKind::EngineGone)),
        }
    }

    async fn inspect_image(&self, _reference: &str) -> Result<(), Error> {
        Ok(())
    }

    async fn create_container(&self, name: String, _config: Config<String>) -> Result<(), Error> {
        self.containers.lock().await.insert(name, false);
        Ok(())
    }

    async fn start_container(&self, name: &str) -> Result<(), Error> {
        self.containers.lock().await.insert(name.to_string(), true);
        Ok(())
    }

    async fn stop_container(&self, name: &str) -> Result<(), Error> {
        self.containers.lock().await.insert(name.to_string(), false);
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<(), Error> {
        self.containers.lock().await.remove(name);
        Ok(())
    }

    async fn list_containers(&self, _all: bool) -> Result<Vec<ContainerSummary>, Error> {
        Ok(Vec::new())
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>, Error> {
        Ok(self.images.lock().await.clone())
    }

    async fn remove_image(&self, reference: &str) -> Result<(), Error> {
        let mut images = self.images.lock().await;
        images.retain(|image| {
            !image
                .repo_tags
                .as_ref()
                .map(|tags| tags.iter().any(|t| t == reference))
                .unwrap_or(false)
        });
        Ok(())
    }

    async fn pull_image(&self, _image: &str, _tag: &str, _registry: Option<&str>) -> Result<(), Error> {
        Ok(())
    }
}
