//! Progress events emitted while a pipeline runs.

use shipyard_core::scan::ScanSummary;
use shipyard_core::{BuildId, Digest, Platform};
use tokio::sync::mpsc;

/// Event emitted during build, scan and publish.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    BuildStarted {
        build: BuildId,
        platform: Platform,
    },
    BuildCompleted {
        build: BuildId,
        platform: Platform,
        digest: Digest,
    },
    BuildFailed {
        build: BuildId,
        platform: Platform,
        message: String,
    },
    /// All platforms built and assembled into one handle.
    ArtifactAssembled {
        build: BuildId,
        digest: Digest,
        platforms: usize,
    },
    ScanCompleted {
        summary: ScanSummary,
        passed: bool,
    },
    Pushed {
        address: String,
        digest: Digest,
    },
    AliasPushed {
        address: String,
    },
    AliasFailed {
        address: String,
        message: String,
    },
}

/// Optional event channel. Sends never fail the pipeline; a closed receiver
/// just means nobody is listening.
#[derive(Debug, Clone, Default)]
pub(crate) struct EventSink {
    tx: Option<mpsc::Sender<PipelineEvent>>,
}

impl EventSink {
    pub(crate) fn new(tx: mpsc::Sender<PipelineEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub(crate) async fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event).await;
        }
    }
}
