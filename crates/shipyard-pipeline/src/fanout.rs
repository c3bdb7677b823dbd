//! Multi-platform build fan-out.
//!
//! The backend prepares the build once, then every platform builds in its
//! own task, at most `max_parallel` at a time. The first failure aborts the
//! remaining builds and fails the whole set.

use shipyard_core::{Backend, BackendConfig, BuildId, Error, PlatformSet, RawArtifact, Result};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::event::{EventSink, PipelineEvent};

/// Build `config` for every platform in `platforms`.
///
/// Results come back in platform order regardless of completion order.
pub(crate) async fn build_all(
    backend: Arc<dyn Backend>,
    id: BuildId,
    config: &BackendConfig,
    platforms: &PlatformSet,
    max_parallel: usize,
    events: &EventSink,
) -> Result<Vec<RawArtifact>> {
    if max_parallel == 0 {
        return Err(Error::Config("max parallel builds must be at least 1".to_string()));
    }

    let config = Arc::new(backend.prepare(id, config).await?);

    let permits = Arc::new(Semaphore::new(max_parallel));
    let mut tasks = JoinSet::new();

    for (index, platform) in platforms.iter().enumerate() {
        let backend = backend.clone();
        let config = config.clone();
        let permits = permits.clone();
        let events = events.clone();
        let platform = platform.clone();

        tasks.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return Err(Error::Cancelled);
            };

            events
                .emit(PipelineEvent::BuildStarted {
                    build: id,
                    platform: platform.clone(),
                })
                .await;
            debug!(build = %id, platform = %platform, "Building platform");

            match backend.build(id, &config, &platform).await {
                Ok(artifact) => {
                    events
                        .emit(PipelineEvent::BuildCompleted {
                            build: id,
                            platform: platform.clone(),
                            digest: artifact.digest.clone(),
                        })
                        .await;
                    Ok((index, artifact))
                }
                Err(e) => {
                    let e = e.for_platform(&platform);
                    events
                        .emit(PipelineEvent::BuildFailed {
                            build: id,
                            platform: platform.clone(),
                            message: e.to_string(),
                        })
                        .await;
                    Err(e)
                }
            }
        });
    }

    let mut results: Vec<Option<RawArtifact>> = vec![None; platforms.len()];

    while let Some(joined) = tasks.join_next().await {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => Err(Error::Cancelled),
            Err(e) => Err(Error::Internal(format!("build task panicked: {}", e))),
        };

        match outcome {
            Ok((index, artifact)) => {
                if artifact.kind != backend.kind() {
                    tasks.abort_all();
                    return Err(Error::Internal(format!(
                        "{} backend returned a {} artifact",
                        backend.kind(),
                        artifact.kind
                    )));
                }
                results[index] = Some(artifact);
            }
            Err(e) => {
                error!(build = %id, error = %e, "Platform build failed, cancelling siblings");
                tasks.abort_all();
                return Err(e);
            }
        }
    }

    let artifacts: Vec<RawArtifact> = results.into_iter().flatten().collect();
    if artifacts.len() != platforms.len() {
        return Err(Error::Internal("missing platform build result".to_string()));
    }

    info!(build = %id, platforms = %platforms, "All platforms built");
    Ok(artifacts)
}
