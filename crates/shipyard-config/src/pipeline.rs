//! Pipeline definition parsing.
//!
//! A `shipyard.kdl` names one artifact backend, the platforms to build,
//! registry credentials, an optional scan gate and the publish target:
//!
//! ```kdl
//! pipeline "base"
//!
//! apko "images/base.yaml" {
//!     repository-append "https://packages.wolfi.dev/os"
//! }
//!
//! platforms "linux/amd64" "linux/arm64"
//! registry "ghcr.io" username="ci-bot" password-env="GHCR_TOKEN"
//! scan severity="critical"
//!
//! publish "ghcr.io/acme/base:${git.short_sha}" {
//!     alias "latest"
//! }
//! ```

use crate::secret::SecretSource;
use crate::variables::VariableContext;
use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use shipyard_core::backend::{ApkoConfig, DockerConfig, HelmConfig, MelangeConfig};
use shipyard_core::{
    BackendConfig, CredentialContext, ImageReference, OutputFormat, Platform, PlatformSet,
    ScanGate, Severity,
};
use std::path::{Path, PathBuf};

/// Default definition file name.
pub const DEFAULT_FILE: &str = "shipyard.kdl";

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineDefinition {
    pub name: String,
    pub backend: BackendConfig,
    /// Raw platform specs; normalized when the pipeline is configured.
    pub platforms: Vec<String>,
    pub max_parallel: Option<usize>,
    pub registries: Vec<RegistryDefinition>,
    pub scan: Option<ScanDefinition>,
    pub publish: Option<PublishDefinition>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegistryDefinition {
    pub address: String,
    pub auth: RegistryAuth,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegistryAuth {
    /// Pushes without credentials (e.g. a local registry).
    Anonymous,
    Credentials {
        username: String,
        password: SecretSource,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanDefinition {
    pub severity: Option<Severity>,
    pub format: Option<OutputFormat>,
    /// When false findings are reported but never block publishing.
    pub enforce: bool,
}

impl ScanDefinition {
    pub fn gate(&self) -> ScanGate {
        let gate = ScanGate::new(self.severity, self.format.clone());
        if self.enforce { gate } else { gate.report_only() }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishDefinition {
    pub tag: String,
    pub aliases: Vec<String>,
}

impl PipelineDefinition {
    /// Normalized platform set, defaulting to the host platform.
    pub fn platform_set(&self) -> ConfigResult<PlatformSet> {
        PlatformSet::normalize(&self.platforms, &Platform::host())
            .map_err(|e| ConfigError::invalid("platforms", e))
    }

    /// Resolve every registry secret into a credential context.
    pub fn credentials(&self) -> ConfigResult<CredentialContext> {
        let mut context = CredentialContext::new();
        for registry in &self.registries {
            if let RegistryAuth::Credentials { username, password } = &registry.auth {
                let secret = password.resolve(&registry.address)?;
                context = context.with(&registry.address, username.as_str(), secret);
            }
        }
        Ok(context)
    }

    pub fn anonymous_registries(&self) -> impl Iterator<Item = &str> {
        self.registries
            .iter()
            .filter(|r| r.auth == RegistryAuth::Anonymous)
            .map(|r| r.address.as_str())
    }

    /// Substitute `${...}` variables in tags, versions and build args.
    ///
    /// Publish references must resolve completely.
    pub fn interpolate(&self, ctx: &VariableContext) -> ConfigResult<Self> {
        let mut ctx = ctx.clone();
        ctx.pipeline_name = self.name.clone();
        let mut def = self.clone();

        match &mut def.backend {
            BackendConfig::Melange(c) => {
                c.version = c.version.as_deref().map(|v| ctx.interpolate(v));
            }
            BackendConfig::Docker(c) => {
                for value in c.build_args.values_mut().chain(c.labels.values_mut()) {
                    *value = ctx.interpolate(value);
                }
            }
            BackendConfig::Helm(c) => {
                c.version = c.version.as_deref().map(|v| ctx.interpolate(v));
                c.app_version = c.app_version.as_deref().map(|v| ctx.interpolate(v));
            }
            BackendConfig::Apko(_) => {}
        }

        if let Some(publish) = &mut def.publish {
            publish.tag = interpolate_strict(&ctx, "publish", &publish.tag)?;
            for alias in &mut publish.aliases {
                *alias = interpolate_strict(&ctx, "alias", alias)?;
            }
            ImageReference::parse(&publish.tag).map_err(|e| ConfigError::invalid("publish", e))?;
        }

        Ok(def)
    }

    /// Make relative backend paths relative to `base`.
    pub fn rebase(mut self, base: &Path) -> Self {
        let join = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };

        match &mut self.backend {
            BackendConfig::Apko(c) => {
                join(&mut c.config);
                c.cache_dir.iter_mut().for_each(join);
            }
            BackendConfig::Melange(c) => {
                join(&mut c.config);
                c.source_dir.iter_mut().for_each(join);
                c.signing_key.iter_mut().for_each(join);
            }
            BackendConfig::Docker(c) => join(&mut c.context),
            BackendConfig::Helm(c) => join(&mut c.chart),
        }
        self
    }
}

fn interpolate_strict(ctx: &VariableContext, field: &str, input: &str) -> ConfigResult<String> {
    let unresolved = ctx.unresolved(input);
    if !unresolved.is_empty() {
        return Err(ConfigError::invalid(
            field,
            format!("unresolved variables: {}", unresolved.join(", ")),
        ));
    }
    Ok(ctx.interpolate(input))
}

/// Read, parse, interpolate and rebase a definition file.
pub fn load_pipeline(path: &Path, ctx: &VariableContext) -> ConfigResult<PipelineDefinition> {
    let text = std::fs::read_to_string(path)?;
    let base = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    Ok(parse_pipeline(&text)?.interpolate(ctx)?.rebase(base))
}

/// Parse a pipeline definition from KDL text.
pub fn parse_pipeline(kdl: &str) -> ConfigResult<PipelineDefinition> {
    let doc: KdlDocument = kdl.parse()?;

    let mut name = String::new();
    let mut backend = None;
    let mut platforms = Vec::new();
    let mut max_parallel = None;
    let mut registries: Vec<RegistryDefinition> = Vec::new();
    let mut scan = None;
    let mut publish = None;

    for node in doc.nodes() {
        match node.name().value() {
            "pipeline" => {
                name = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("pipeline name".to_string()))?;
            }
            kind @ ("apko" | "melange" | "docker" | "helm") => {
                if backend.is_some() {
                    return Err(ConfigError::Duplicate(format!(
                        "backend '{}': a pipeline builds exactly one artifact",
                        kind
                    )));
                }
                backend = Some(parse_backend(kind, node)?);
            }
            "platforms" => {
                platforms.extend(get_all_string_args(node));
            }
            "max-parallel" => {
                max_parallel = Some(parse_max_parallel(node)?);
            }
            "registry" => {
                let registry = parse_registry(node)?;
                // Later definitions win, as with repeated registry auth.
                registries.retain(|r| r.address != registry.address);
                registries.push(registry);
            }
            "scan" => {
                scan = Some(parse_scan(node)?);
            }
            "publish" => {
                if publish.is_some() {
                    return Err(ConfigError::Duplicate("publish".to_string()));
                }
                publish = Some(parse_publish(node)?);
            }
            _ => {}
        }
    }

    if name.is_empty() {
        return Err(ConfigError::MissingField("pipeline name".to_string()));
    }
    let backend = backend.ok_or_else(|| {
        ConfigError::MissingField("backend (apko, melange, docker or helm)".to_string())
    })?;

    let def = PipelineDefinition {
        name,
        backend,
        platforms,
        max_parallel,
        registries,
        scan,
        publish,
    };
    def.platform_set()?;
    Ok(def)
}

fn parse_backend(kind: &str, node: &KdlNode) -> ConfigResult<BackendConfig> {
    let path = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField(format!("{} path", kind)))?;
    let children = node.children().map(|c| c.nodes()).unwrap_or_default();

    let mut config = match kind {
        "apko" => BackendConfig::Apko(ApkoConfig::new(&path)),
        "melange" => BackendConfig::Melange(MelangeConfig::new(&path)),
        "docker" => BackendConfig::Docker(DockerConfig::new(&path)),
        _ => BackendConfig::Helm(HelmConfig::new(&path)),
    };

    for child in children {
        let key = child.name().value();
        let value = get_first_string_arg(child);
        let flag = get_first_bool_arg(child).unwrap_or(true);

        if key == "name" {
            let name = value.ok_or_else(|| ConfigError::MissingField("name".to_string()))?;
            match &mut config {
                BackendConfig::Apko(c) => c.name = name,
                BackendConfig::Melange(c) => c.name = name,
                BackendConfig::Docker(c) => c.name = name,
                BackendConfig::Helm(c) => c.name = name,
            }
            continue;
        }

        match (&mut config, key) {
            (BackendConfig::Apko(c), "keyring-append") => c.keyring_append.extend(get_all_string_args(child)),
            (BackendConfig::Apko(c), "repository-append") => c.repository_append.extend(get_all_string_args(child)),
            (BackendConfig::Apko(c), "package-append") => c.package_append.extend(get_all_string_args(child)),
            (BackendConfig::Apko(c), "cache-dir") => c.cache_dir = value.map(PathBuf::from),

            (BackendConfig::Melange(c), "keyring-append") => c.keyring_append.extend(get_all_string_args(child)),
            (BackendConfig::Melange(c), "repository-append") => c.repository_append.extend(get_all_string_args(child)),
            (BackendConfig::Melange(c), "source-dir") => c.source_dir = value.map(PathBuf::from),
            (BackendConfig::Melange(c), "signing-key") => c.signing_key = value.map(PathBuf::from),
            (BackendConfig::Melange(c), "version") => c.version = value,

            (BackendConfig::Docker(c), "dockerfile") => c.dockerfile = value,
            (BackendConfig::Docker(c), "target") => c.target = value,
            (BackendConfig::Docker(c), "no-cache") => c.no_cache = flag,
            (BackendConfig::Docker(c), "build-arg") => {
                let (k, v) = get_key_value(child, "build-arg")?;
                c.build_args.insert(k, v);
            }
            (BackendConfig::Docker(c), "label") => {
                let (k, v) = get_key_value(child, "label")?;
                c.labels.insert(k, v);
            }

            (BackendConfig::Helm(c), "version") => c.version = value,
            (BackendConfig::Helm(c), "app-version") => c.app_version = value,
            (BackendConfig::Helm(c), "dependency-update") => c.dependency_update = flag,

            (config, key) => {
                return Err(ConfigError::invalid(
                    key,
                    format!("not a {} option", config.kind()),
                ));
            }
        }
    }

    Ok(config)
}

fn parse_max_parallel(node: &KdlNode) -> ConfigResult<usize> {
    let value = node
        .entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
        .ok_or_else(|| ConfigError::MissingField("max-parallel value".to_string()))?;

    match usize::try_from(value) {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::invalid(
            "max-parallel",
            format!("{} is not a positive number", value),
        )),
    }
}

fn parse_registry(node: &KdlNode) -> ConfigResult<RegistryDefinition> {
    let address = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("registry address".to_string()))?;

    if get_bool_prop(node, "anonymous").unwrap_or(false) {
        return Ok(RegistryDefinition {
            address,
            auth: RegistryAuth::Anonymous,
        });
    }

    let username = get_string_prop(node, "username")
        .ok_or_else(|| ConfigError::MissingField(format!("username for registry '{}'", address)))?;

    let sources: Vec<SecretSource> = [
        get_string_prop(node, "password-env").map(SecretSource::Env),
        get_string_prop(node, "password-file").map(|p| SecretSource::File(PathBuf::from(p))),
        get_string_prop(node, "password").map(SecretSource::Literal),
    ]
    .into_iter()
    .flatten()
    .collect();

    let password = match <[SecretSource; 1]>::try_from(sources) {
        Ok([source]) => source,
        Err(sources) if sources.is_empty() => {
            return Err(ConfigError::MissingField(format!(
                "password-env, password-file or password for registry '{}'",
                address
            )));
        }
        Err(_) => {
            return Err(ConfigError::invalid(
                format!("registry '{}'", address),
                "only one password source may be given",
            ));
        }
    };

    Ok(RegistryDefinition {
        address,
        auth: RegistryAuth::Credentials { username, password },
    })
}

fn parse_scan(node: &KdlNode) -> ConfigResult<ScanDefinition> {
    let severity = get_string_prop(node, "severity")
        .map(|s| s.parse::<Severity>())
        .transpose()
        .map_err(|e| ConfigError::invalid("scan severity", e))?;

    Ok(ScanDefinition {
        severity,
        format: get_string_prop(node, "format").map(OutputFormat::new),
        enforce: get_bool_prop(node, "enforce").unwrap_or(true),
    })
}

fn parse_publish(node: &KdlNode) -> ConfigResult<PublishDefinition> {
    let tag = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("publish reference".to_string()))?;

    let mut aliases = Vec::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == "alias" {
                aliases.extend(get_all_string_args(child));
            }
        }
    }

    Ok(PublishDefinition { tag, aliases })
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_first_bool_arg(node: &KdlNode) -> Option<bool> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_bool())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_key_value(node: &KdlNode, field: &str) -> ConfigResult<(String, String)> {
    match get_all_string_args(node).as_slice() {
        [key, value] => Ok((key.clone(), value.clone())),
        _ => Err(ConfigError::invalid(field, "expected a key and a value")),
    }
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipyard_core::BackendKind;

    #[test]
    fn test_parse_apko_pipeline() {
        let kdl = r#"
            pipeline "base"

            apko "images/base.yaml" {
                keyring-append "https://packages.wolfi.dev/os/wolfi-signing.rsa.pub"
                repository-append "https://packages.wolfi.dev/os"
                package-append "curl" "jq"
            }

            platforms "linux/amd64" "linux/arm64"
            max-parallel 2
        "#;

        let def = parse_pipeline(kdl).unwrap();
        assert_eq!(def.name, "base");
        assert_eq!(def.max_parallel, Some(2));
        assert_eq!(def.platform_set().unwrap().len(), 2);

        let BackendConfig::Apko(apko) = &def.backend else {
            panic!("expected apko backend");
        };
        assert_eq!(apko.config, PathBuf::from("images/base.yaml"));
        assert_eq!(apko.name, "base");
        assert_eq!(apko.package_append, vec!["curl", "jq"]);
        assert_eq!(apko.repository_append.len(), 1);
    }

    #[test]
    fn test_parse_docker_options() {
        let kdl = r#"
            pipeline "api"

            docker "services/api" {
                dockerfile "build/Dockerfile"
                target "runtime"
                no-cache
                build-arg "VERSION" "${git.short_sha}"
                label "org.opencontainers.image.source" "https://github.com/acme/api"
            }
        "#;

        let def = parse_pipeline(kdl).unwrap();
        let BackendConfig::Docker(docker) = &def.backend else {
            panic!("expected docker backend");
        };
        assert_eq!(docker.dockerfile(), "build/Dockerfile");
        assert_eq!(docker.target.as_deref(), Some("runtime"));
        assert!(docker.no_cache);
        assert_eq!(docker.build_args["VERSION"], "${git.short_sha}");
        assert_eq!(docker.labels.len(), 1);
    }

    #[test]
    fn test_parse_registries_scan_and_publish() {
        let kdl = r#"
            pipeline "web"

            helm "charts/web" {
                version "1.2.3"
                dependency-update
            }

            registry "ghcr.io" username="first" password-env="GHCR_TOKEN"
            registry "ghcr.io" username="bot" password-file="/run/secrets/ghcr"
            registry "localhost:5000" anonymous=#true

            scan severity="high" format="json" enforce=#false

            publish "ghcr.io/acme/charts/web:1.2.3" {
                alias "latest"
                alias "stable"
            }
        "#;

        let def = parse_pipeline(kdl).unwrap();
        assert_eq!(def.backend.kind(), BackendKind::Helm);

        assert_eq!(def.registries.len(), 2);
        assert_eq!(
            def.registries[0].auth,
            RegistryAuth::Credentials {
                username: "bot".to_string(),
                password: SecretSource::File(PathBuf::from("/run/secrets/ghcr")),
            }
        );
        assert_eq!(def.anonymous_registries().collect::<Vec<_>>(), vec!["localhost:5000"]);

        let scan = def.scan.as_ref().unwrap();
        assert_eq!(scan.severity, Some(Severity::High));
        let gate = scan.gate();
        assert!(!gate.enforce);
        assert_eq!(gate.output_format.as_str(), "json");

        let publish = def.publish.as_ref().unwrap();
        assert_eq!(publish.tag, "ghcr.io/acme/charts/web:1.2.3");
        assert_eq!(publish.aliases, vec!["latest", "stable"]);
    }

    #[test]
    fn test_missing_backend() {
        let result = parse_pipeline(r#"pipeline "empty""#);
        assert!(matches!(result.unwrap_err(), ConfigError::MissingField(_)));
    }

    #[test]
    fn test_two_backends_rejected() {
        let kdl = r#"
            pipeline "both"
            apko "a.yaml"
            docker "."
        "#;
        assert!(matches!(parse_pipeline(kdl).unwrap_err(), ConfigError::Duplicate(_)));
    }

    #[test]
    fn test_option_for_wrong_backend_rejected() {
        let kdl = r#"
            pipeline "pkg"
            melange "melange.yaml" {
                dockerfile "Dockerfile"
            }
        "#;
        assert!(matches!(
            parse_pipeline(kdl).unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_invalid_values() {
        let bad_platform = r#"
            pipeline "x"
            apko "a.yaml"
            platforms "linux/amd64/v1/extra"
        "#;
        assert!(parse_pipeline(bad_platform).is_err());

        let bad_parallel = r#"
            pipeline "x"
            apko "a.yaml"
            max-parallel 0
        "#;
        assert!(parse_pipeline(bad_parallel).is_err());

        let bad_severity = r#"
            pipeline "x"
            apko "a.yaml"
            scan severity="severe"
        "#;
        assert!(parse_pipeline(bad_severity).is_err());

        let no_password = r#"
            pipeline "x"
            apko "a.yaml"
            registry "ghcr.io" username="bot"
        "#;
        assert!(parse_pipeline(no_password).is_err());
    }

    #[test]
    fn test_interpolate_and_rebase() {
        let kdl = r#"
            pipeline "pkg"
            melange "melange.yaml" {
                version "${release}"
                signing-key "/keys/melange.rsa"
            }
            publish "ghcr.io/acme/${pipeline.name}:${release}" {
                alias "latest"
            }
        "#;

        let mut ctx = VariableContext::new();
        ctx.set("release", "2.0.1");

        let def = parse_pipeline(kdl)
            .unwrap()
            .interpolate(&ctx)
            .unwrap()
            .rebase(Path::new("/repo"));

        let publish = def.publish.as_ref().unwrap();
        assert_eq!(publish.tag, "ghcr.io/acme/pkg:2.0.1");

        let BackendConfig::Melange(melange) = &def.backend else {
            panic!("expected melange backend");
        };
        assert_eq!(melange.version.as_deref(), Some("2.0.1"));
        assert_eq!(melange.config, PathBuf::from("/repo/melange.yaml"));
        assert_eq!(melange.signing_key, Some(PathBuf::from("/keys/melange.rsa")));
    }

    #[test]
    fn test_unresolved_publish_variable_rejected() {
        let kdl = r#"
            pipeline "x"
            apko "a.yaml"
            publish "ghcr.io/acme/x:${git.tag}"
        "#;
        let err = parse_pipeline(kdl)
            .unwrap()
            .interpolate(&VariableContext::new())
            .unwrap_err();
        assert!(err.to_string().contains("git.tag"));
    }

    #[test]
    fn test_credentials_from_literal() {
        let kdl = r#"
            pipeline "x"
            apko "a.yaml"
            registry "https://registry.example.com/" username="bot" password="pw"
        "#;
        let creds = parse_pipeline(kdl).unwrap().credentials().unwrap();
        let entry = creds.resolve("registry.example.com").unwrap();
        assert_eq!(entry.principal, "bot");
        assert_eq!(entry.secret.expose(), "pw");
    }

    #[test]
    fn test_load_pipeline_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_FILE);
        std::fs::write(
            &path,
            "pipeline \"site\"\ndocker \"web\"\npublish \"localhost:5000/site:dev\"\n",
        )
        .unwrap();

        let def = load_pipeline(&path, &VariableContext::new()).unwrap();
        let BackendConfig::Docker(docker) = &def.backend else {
            panic!("expected docker backend");
        };
        assert_eq!(docker.context, dir.path().join("web"));
        assert_eq!(docker.name, "web");
    }
}
