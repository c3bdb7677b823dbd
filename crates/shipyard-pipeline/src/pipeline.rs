//! The build → scan gate → publish pipeline.

use shipyard_core::scan::ScanSummary;
use shipyard_core::{
    AliasFailure, ArtifactContent, ArtifactHandle, Backend, BackendConfig, BuildId,
    CredentialContext, CredentialEntry, Digest, Error, GateDecision, ImageReference, OutputFormat,
    Platform, PlatformSet, PublishedRef, Result, ScanGate, ScanReport, ScanTarget, Scanner,
    Secret, Severity,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::event::{EventSink, PipelineEvent};
use crate::fanout;

/// A configured pipeline.
///
/// Configuration calls return a new value and leave `self` untouched, so
/// pipelines can branch from a shared prefix. `build` and `publish` likewise
/// return the pipeline holding their result.
#[derive(Clone)]
pub struct Pipeline {
    backend: Arc<dyn Backend>,
    scanner: Option<Arc<dyn Scanner>>,
    credentials: CredentialContext,
    anonymous_registries: Vec<String>,
    default_platform: Platform,
    platforms: Option<PlatformSet>,
    max_parallel: Option<usize>,
    gate: Option<ScanGate>,
    artifact: Option<Arc<ArtifactHandle>>,
    published: Option<Arc<PublishedRef>>,
    scan_report: Option<Arc<ScanReport>>,
    events: EventSink,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("backend", &self.backend.kind())
            .field("scanner", &self.scanner.as_ref().map(|s| s.name()))
            .field("credentials", &self.credentials)
            .field("platforms", &self.platforms)
            .field("gate", &self.gate)
            .field("artifact", &self.artifact.as_ref().map(|a| a.digest()))
            .field("published", &self.published.as_ref().map(|p| &p.address))
            .finish()
    }
}

impl Pipeline {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            scanner: None,
            credentials: CredentialContext::new(),
            anonymous_registries: Vec::new(),
            default_platform: Platform::host(),
            platforms: None,
            max_parallel: None,
            gate: None,
            artifact: None,
            published: None,
            scan_report: None,
            events: EventSink::default(),
        }
    }

    /// Upsert credentials for `address`. Never contacts the registry.
    pub fn with_registry_auth(
        &self,
        address: &str,
        principal: impl Into<String>,
        secret: impl Into<Secret>,
    ) -> Self {
        Self {
            credentials: self.credentials.with(address, principal, secret),
            ..self.clone()
        }
    }

    /// Allow pushing to `address` without credentials.
    pub fn with_anonymous_registry(&self, address: &str) -> Self {
        let address = shipyard_core::credential::normalize_address(address);
        let mut anonymous_registries = self.anonymous_registries.clone();
        if !anonymous_registries.contains(&address) {
            anonymous_registries.push(address);
        }
        Self {
            anonymous_registries,
            ..self.clone()
        }
    }

    pub fn with_scanner(&self, scanner: Arc<dyn Scanner>) -> Self {
        Self {
            scanner: Some(scanner),
            ..self.clone()
        }
    }

    /// Platform used when no platforms are requested.
    pub fn with_default_platform(&self, platform: Platform) -> Self {
        Self {
            default_platform: platform,
            ..self.clone()
        }
    }

    /// Platforms for subsequent builds, in list or comma-separated form.
    pub fn with_platforms<I, S>(&self, specs: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let platforms = PlatformSet::normalize(specs, &self.default_platform)?;
        Ok(Self {
            platforms: Some(platforms),
            ..self.clone()
        })
    }

    /// Bound the number of platforms built at once.
    pub fn with_max_parallel(&self, max_parallel: usize) -> Self {
        Self {
            max_parallel: Some(max_parallel),
            ..self.clone()
        }
    }

    pub fn with_events(&self, tx: mpsc::Sender<PipelineEvent>) -> Self {
        Self {
            events: EventSink::new(tx),
            ..self.clone()
        }
    }

    /// Gate the next publish on a scan at `cutoff`.
    pub fn with_scan(&self, cutoff: Option<Severity>, format: Option<OutputFormat>) -> Self {
        self.with_scan_gate(ScanGate::new(cutoff, format))
    }

    /// Scan before the next publish and report findings without blocking.
    pub fn with_scan_report_only(
        &self,
        cutoff: Option<Severity>,
        format: Option<OutputFormat>,
    ) -> Self {
        self.with_scan_gate(ScanGate::new(cutoff, format).report_only())
    }

    pub fn with_scan_gate(&self, gate: ScanGate) -> Self {
        Self {
            gate: Some(gate),
            ..self.clone()
        }
    }

    /// Build `config` for `platforms`, or the configured platforms, or the
    /// default platform.
    ///
    /// All platforms must succeed; a failure of any one discards the others.
    pub async fn build(&self, config: &BackendConfig, platforms: Option<&PlatformSet>) -> Result<Self> {
        let kind = self.backend.kind();
        if config.kind() != kind {
            return Err(config.mismatch(kind));
        }

        let requested = platforms
            .cloned()
            .or_else(|| self.platforms.clone())
            .unwrap_or_else(|| PlatformSet::single(self.default_platform.clone()));
        let platforms = if self.backend.platform_independent() {
            PlatformSet::single(requested.primary().clone())
        } else {
            requested
        };

        let id = BuildId::new();
        let max_parallel = self.max_parallel.unwrap_or(platforms.len());
        info!(build = %id, backend = %kind, platforms = %platforms, "Starting build");

        let artifacts = fanout::build_all(
            self.backend.clone(),
            id,
            config,
            &platforms,
            max_parallel,
            &self.events,
        )
        .await?;

        let handle = ArtifactHandle::assemble(id, config.local_reference(id), artifacts)?;
        info!(build = %id, digest = %handle.digest(), "Artifact assembled");
        self.events
            .emit(PipelineEvent::ArtifactAssembled {
                build: id,
                digest: handle.digest().clone(),
                platforms: handle.platforms().len(),
            })
            .await;

        Ok(Self {
            artifact: Some(Arc::new(handle)),
            published: None,
            scan_report: None,
            ..self.clone()
        })
    }

    /// Publish the current artifact under `tag`, plus `extra_tags` as aliases
    /// of the same digest.
    ///
    /// A bound scan gate runs first and is consumed. Credentials for every
    /// registry involved are resolved before anything is pushed.
    pub async fn publish<I, S>(&self, tag: &str, extra_tags: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let artifact = self
            .artifact
            .clone()
            .ok_or_else(|| Error::NotBuilt("nothing to publish, build first".to_string()))?;

        let target = ImageReference::parse(tag)?.or_default_tag();
        let aliases = extra_tags
            .into_iter()
            .map(|t| target.resolve_alias(t.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        let scan_report = match &self.gate {
            Some(gate) => Some(Arc::new(self.run_gate(gate, &artifact).await?)),
            None => self.scan_report.clone(),
        };

        let primary_credentials = self.credentials_for(&target)?;
        let alias_credentials = aliases
            .iter()
            .map(|alias| self.credentials_for(alias))
            .collect::<Result<Vec<_>>>()?;

        let mut logged_in: Vec<&str> = Vec::new();
        for entry in std::iter::once(primary_credentials)
            .chain(alias_credentials.iter().copied())
            .flatten()
        {
            if logged_in.contains(&entry.address.as_str()) {
                continue;
            }
            info!(registry = %entry.address, principal = %entry.principal, "Logging in");
            self.backend.login(entry).await?;
            logged_in.push(&entry.address);
        }

        info!(target = %target, digest = %artifact.digest(), "Pushing");
        let mut published = self
            .backend
            .push(&artifact, &target, primary_credentials)
            .await?;
        self.events
            .emit(PipelineEvent::Pushed {
                address: published.address.clone(),
                digest: published.digest.clone(),
            })
            .await;

        let mut failures = Vec::new();
        for (alias, credentials) in aliases.iter().zip(alias_credentials) {
            match self.backend.alias(&published, alias, credentials).await {
                Ok(()) => {
                    info!(alias = %alias, digest = %published.digest, "Alias pushed");
                    published.aliases.push(alias.to_string());
                    self.events
                        .emit(PipelineEvent::AliasPushed {
                            address: alias.to_string(),
                        })
                        .await;
                }
                Err(e) => {
                    warn!(alias = %alias, error = %e, "Alias push failed");
                    self.events
                        .emit(PipelineEvent::AliasFailed {
                            address: alias.to_string(),
                            message: e.to_string(),
                        })
                        .await;
                    failures.push(AliasFailure {
                        target: alias.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        if !failures.is_empty() {
            return Err(Error::AliasPush {
                published: Box::new(published),
                failures,
            });
        }

        info!(reference = %published.reference, "Published");
        Ok(Self {
            gate: None,
            published: Some(Arc::new(published)),
            scan_report,
            ..self.clone()
        })
    }

    /// Scan every platform of `artifact` and evaluate `gate`.
    async fn run_gate(&self, gate: &ScanGate, artifact: &ArtifactHandle) -> Result<ScanReport> {
        let scanner = self.scanner.as_ref().ok_or_else(|| {
            Error::Config("a scan gate is configured but no scanner is attached".to_string())
        })?;

        let mut reports = Vec::with_capacity(artifact.manifests().len());
        for raw in artifact.manifests() {
            let target = ScanTarget::from(&raw.content);
            info!(scanner = scanner.name(), platform = %raw.platform, target = %target, "Scanning");
            reports.push(scanner.scan(&target, &gate.output_format, None).await?);
        }
        let report = ScanReport::merge(reports);

        let decision = gate.evaluate(&report);
        self.events
            .emit(PipelineEvent::ScanCompleted {
                summary: report.summary(),
                passed: decision.passed(),
            })
            .await;

        match gate.check(&report)? {
            GateDecision::Pass => {
                info!(findings = report.findings().len(), "Scan gate passed");
            }
            GateDecision::Fail(findings) => {
                warn!(
                    findings = findings.len(),
                    "Scan gate failed but is report-only, continuing"
                );
            }
        }

        Ok(report)
    }

    /// Credentials for the registry of `target`; anonymous registries get
    /// none, any other registry must have an entry.
    fn credentials_for(&self, target: &ImageReference) -> Result<Option<&CredentialEntry>> {
        let registry = target.registry();
        match self.credentials.resolve(registry) {
            Some(entry) => Ok(Some(entry)),
            None if self.anonymous_registries.iter().any(|a| a == registry) => Ok(None),
            None => Err(Error::Auth {
                registry: registry.to_string(),
                message: "no credentials configured".to_string(),
            }),
        }
    }

    /// Published reference by digest.
    pub fn reference(&self) -> Result<&str> {
        self.published()
            .map(|p| p.reference.as_str())
            .ok_or_else(|| Error::NotBuilt("not published".to_string()))
    }

    /// Published tagged address.
    pub fn address(&self) -> Result<&str> {
        self.published()
            .map(|p| p.address.as_str())
            .ok_or_else(|| Error::NotBuilt("not published".to_string()))
    }

    /// Digest of the published artifact, or of the built one.
    pub fn digest(&self) -> Result<&Digest> {
        if let Some(published) = self.published() {
            return Ok(&published.digest);
        }
        self.artifact()
            .map(|a| a.digest())
            .ok_or_else(|| Error::NotBuilt("not built".to_string()))
    }

    /// Raw content for `platform`, or for the primary platform.
    pub fn contents(&self, platform: Option<&Platform>) -> Result<&ArtifactContent> {
        let artifact = self
            .artifact()
            .ok_or_else(|| Error::NotBuilt("not built".to_string()))?;
        artifact.contents(platform).ok_or_else(|| {
            Error::NotBuilt(format!(
                "no artifact for platform {}",
                platform.map(|p| p.to_string()).unwrap_or_default()
            ))
        })
    }

    pub fn artifact(&self) -> Option<&ArtifactHandle> {
        self.artifact.as_deref()
    }

    pub fn published(&self) -> Option<&PublishedRef> {
        self.published.as_deref()
    }

    /// Report of the last gated publish.
    pub fn scan_report(&self) -> Option<&ScanReport> {
        self.scan_report.as_deref()
    }

    pub fn scan_summary(&self) -> Option<ScanSummary> {
        self.scan_report().map(|r| r.summary())
    }

    pub fn gate(&self) -> Option<&ScanGate> {
        self.gate.as_ref()
    }

    pub fn credentials(&self) -> &CredentialContext {
        &self.credentials
    }
}
