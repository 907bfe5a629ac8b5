//! Provider adapters: a uniform launch contract over agent backends.
//!
//! The [`Provider`] trait decouples the orchestrator from the concrete agent
//! CLI. Each backend is a stateless struct selected by name from config.
//! Model resolution never falls back: an unknown or unlisted model is a
//! preflight failure, not a silent substitution.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{debug, instrument, warn};

use crate::core::types::ReasonCode;
use crate::error::FleetError;
use crate::io::config::{FleetConfig, ProviderConfig, ProviderKind};
use crate::io::process::{DetachedSpec, spawn_detached};

/// Result of a provider health probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeStatus {
    Ok,
    Degraded(String),
}

/// Authentication material for one launch. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// Stable description of where the secret came from, e.g. `env:OPENAI_API_KEY`.
    pub source: String,
    /// Environment variable the agent reads the secret from.
    pub env_key: String,
    pub value: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("source", &self.source)
            .field("env_key", &self.env_key)
            .field("value", &"<redacted>")
            .finish()
    }
}

/// Supplies credentials at `start`/`restart` time.
pub trait CredentialResolver: Send + Sync {
    /// Resolve the credential stored under `env_key`.
    fn resolve(&self, env_key: &str) -> Result<Credential>;

    /// Re-resolve from a recorded source (`env:KEY`).
    fn resolve_source(&self, source: &str) -> Result<Credential> {
        match source.strip_prefix("env:") {
            Some(key) => self.resolve(key),
            None => Err(preflight(
                ReasonCode::AuthError,
                format!("unsupported credential source '{source}'"),
            )),
        }
    }
}

/// Reads credentials from the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvCredentials;

impl CredentialResolver for EnvCredentials {
    fn resolve(&self, env_key: &str) -> Result<Credential> {
        match std::env::var(env_key) {
            Ok(value) if !value.trim().is_empty() => Ok(Credential {
                source: format!("env:{env_key}"),
                env_key: env_key.to_string(),
                value,
            }),
            _ => Err(preflight(
                ReasonCode::AuthError,
                format!("credential {env_key} is missing or empty"),
            )),
        }
    }
}

/// Credentials from a fixed map.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    values: BTreeMap<String, String>,
}

impl StaticCredentials {
    pub fn new<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: values
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl CredentialResolver for StaticCredentials {
    fn resolve(&self, env_key: &str) -> Result<Credential> {
        match self.values.get(env_key) {
            Some(value) if !value.is_empty() => Ok(Credential {
                source: format!("env:{env_key}"),
                env_key: env_key.to_string(),
                value: value.clone(),
            }),
            _ => Err(preflight(
                ReasonCode::AuthError,
                format!("credential {env_key} is missing or empty"),
            )),
        }
    }
}

/// Everything a provider needs to launch one attempt.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub job_id: String,
    pub attempt: u32,
    pub model: String,
    pub worktree: PathBuf,
    pub prompt_path: PathBuf,
    pub log_path: PathBuf,
    pub exit_code_path: PathBuf,
    pub credential: Option<Credential>,
}

/// Capability contract for an agent backend.
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    fn config(&self) -> &ProviderConfig;

    fn kind(&self) -> ProviderKind {
        self.config().kind
    }

    /// Full agent argv for `model`. The prompt is always delivered on stdin.
    fn agent_argv(&self, model: &str) -> Vec<String>;

    /// Map a requested model (or none) to the canonical model, refusing fallback.
    fn resolve_model(&self, requested: Option<&str>) -> Result<String> {
        resolve_model(self.name(), self.config(), requested)
    }

    /// Environment variable holding this provider's credential, if it needs one.
    fn credential_key(&self) -> Option<&str> {
        self.config().credential_env.as_deref()
    }

    /// Cheap readiness check: the agent binary is resolvable.
    fn health_probe(&self) -> ProbeStatus {
        let Some(program) = self.config().command.first() else {
            return ProbeStatus::Degraded("empty command".to_string());
        };
        if find_program(program).is_some() {
            ProbeStatus::Ok
        } else {
            ProbeStatus::Degraded(format!("{program} not found on PATH"))
        }
    }

    /// Launch detached and return the process-group id.
    #[instrument(skip_all, fields(provider = self.name(), job_id = %request.job_id, attempt = request.attempt))]
    fn launch(&self, request: &LaunchRequest) -> Result<u32> {
        let mut envs = vec![
            ("FLEET_JOB_ID".to_string(), request.job_id.clone()),
            ("FLEET_MODEL".to_string(), request.model.clone()),
            ("FLEET_ATTEMPT".to_string(), request.attempt.to_string()),
        ];
        if let Some(credential) = &request.credential {
            envs.push((credential.env_key.clone(), credential.value.clone()));
        }
        let spec = DetachedSpec {
            argv: self.agent_argv(&request.model),
            workdir: request.worktree.clone(),
            stdin_path: request.prompt_path.clone(),
            log_path: request.log_path.clone(),
            exit_code_path: request.exit_code_path.clone(),
            envs,
        };
        debug!(argv = ?spec.argv, "launching agent");
        spawn_detached(&spec)
    }
}

/// `claude` CLI in print mode.
#[derive(Debug, Clone)]
pub struct ClaudeProvider {
    name: String,
    config: ProviderConfig,
}

impl Provider for ClaudeProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn agent_argv(&self, model: &str) -> Vec<String> {
        let mut argv = self.config.command.clone();
        argv.extend(
            [
                "--print",
                "--model",
                model,
                "--dangerously-skip-permissions",
            ]
            .map(str::to_string),
        );
        argv
    }
}

/// `codex exec` reading the prompt from stdin.
#[derive(Debug, Clone)]
pub struct CodexProvider {
    name: String,
    config: ProviderConfig,
}

impl Provider for CodexProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn agent_argv(&self, model: &str) -> Vec<String> {
        let mut argv = self.config.command.clone();
        argv.extend(
            [
                "exec",
                "--model",
                model,
                "--sandbox",
                "danger-full-access",
                "--skip-git-repo-check",
                "-",
            ]
            .map(str::to_string),
        );
        argv
    }
}

/// Arbitrary command; the model is passed only through `FLEET_MODEL`.
#[derive(Debug, Clone)]
pub struct CommandProvider {
    name: String,
    config: ProviderConfig,
}

impl Provider for CommandProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn agent_argv(&self, _model: &str) -> Vec<String> {
        self.config.command.clone()
    }
}

/// Build the adapter for one configured provider.
pub fn build_provider(name: &str, config: &ProviderConfig) -> Box<dyn Provider> {
    let name = name.to_string();
    let config = config.clone();
    match config.kind {
        ProviderKind::Claude => Box::new(ClaudeProvider { name, config }),
        ProviderKind::Codex => Box::new(CodexProvider { name, config }),
        ProviderKind::Command => Box::new(CommandProvider { name, config }),
    }
}

/// Providers selected by name at `start` time.
pub struct ProviderRegistry {
    providers: BTreeMap<String, Box<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn from_config(config: &FleetConfig) -> Self {
        let providers = config
            .providers
            .iter()
            .map(|(name, cfg)| (name.clone(), build_provider(name, cfg)))
            .collect();
        Self { providers }
    }

    pub fn names(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }

    pub fn get(&self, name: &str) -> Result<&dyn Provider> {
        self.providers
            .get(name)
            .map(|p| &**p)
            .ok_or_else(|| {
                preflight(
                    ReasonCode::StartFailed,
                    format!(
                        "unknown provider '{name}' (configured: {})",
                        self.names().join(", ")
                    ),
                )
            })
    }
}

/// Preflight outcome: everything `start` needs before creating artifacts.
#[derive(Debug, Clone)]
pub struct Preflight {
    pub provider: String,
    pub kind: ProviderKind,
    pub model: String,
    pub credential: Option<Credential>,
}

/// Probe, resolve the model and resolve credentials. Creates nothing on disk.
#[instrument(skip_all, fields(provider = provider.name()))]
pub fn preflight_check(
    provider: &dyn Provider,
    requested_model: Option<&str>,
    credentials: &dyn CredentialResolver,
) -> Result<Preflight> {
    if let ProbeStatus::Degraded(message) = provider.health_probe() {
        warn!(%message, "provider probe degraded");
        return Err(preflight(ReasonCode::StartFailed, message));
    }
    let model = provider.resolve_model(requested_model)?;
    let credential = provider
        .credential_key()
        .map(|key| credentials.resolve(key))
        .transpose()?;
    Ok(Preflight {
        provider: provider.name().to_string(),
        kind: provider.kind(),
        model,
        credential,
    })
}

fn resolve_model(name: &str, config: &ProviderConfig, requested: Option<&str>) -> Result<String> {
    let requested = match requested.map(str::trim).filter(|m| !m.is_empty()) {
        Some(model) => model.to_string(),
        None => config.default_model.clone().ok_or_else(|| {
            preflight(
                ReasonCode::ModelUnavailable,
                format!("provider {name} has no default model; pass --model"),
            )
        })?,
    };
    let canonical = config
        .aliases
        .get(&requested)
        .cloned()
        .unwrap_or(requested);
    if !config.models.is_empty() && !config.models.contains(&canonical) {
        return Err(preflight(
            ReasonCode::ModelUnavailable,
            format!(
                "model '{canonical}' is not available on provider {name} (available: {})",
                config.models.join(", ")
            ),
        ));
    }
    Ok(canonical)
}

fn preflight(reason: ReasonCode, message: String) -> anyhow::Error {
    FleetError::Preflight { reason, message }.into()
}

/// Locate `program` the way a shell would: as a path, or on `$PATH`.
pub fn find_program(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let path = PathBuf::from(program);
        return is_executable(&path).then_some(path);
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
