//! Fleet configuration stored at `<home>/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::closure::ClosurePolicy;

/// Fleet configuration (TOML).
///
/// Host-local and edited by humans. Missing fields default to values that are
/// safe on a fresh machine (no controller role, archive off).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FleetConfig {
    /// Root under which every job worktree must live. Relative paths resolve
    /// against the fleet home.
    pub scratch_root: Option<PathBuf>,
    pub jobs: JobsConfig,
    pub closure: ClosureConfig,
    pub guardian: GuardianConfig,
    pub providers: BTreeMap<String, ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct JobsConfig {
    /// Restarts allowed before a job is failed with `retry_exhausted`.
    pub retry_ceiling: u32,
    pub poll_interval_secs: u64,
    /// Terminal jobs older than this are removed by `prune`.
    pub retention_hours: u64,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    /// Grace period between SIGTERM and SIGKILL.
    pub stop_grace_secs: u64,
    /// Directory names skipped when fingerprinting a worktree for mutations.
    pub mutation_ignore: Vec<String>,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            retry_ceiling: 3,
            poll_interval_secs: 30,
            retention_hours: 72,
            backoff_base_secs: 30,
            backoff_max_secs: 600,
            stop_grace_secs: 10,
            mutation_ignore: vec![
                ".git".to_string(),
                "target".to_string(),
                "node_modules".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClosureConfig {
    pub remote: String,
    pub trunk: String,
    pub cooldown_hours: u64,
    pub staleness_hours: u64,
    /// Marker file asserting an active session in a worktree or clone.
    pub session_marker: String,
    pub session_fresh_minutes: u64,
    /// Review requests a single sweep may open.
    pub review_budget: u32,
    pub archive: bool,
    pub archive_dir: Option<PathBuf>,
    /// Timeout for fetch/push and review-request calls.
    pub network_timeout_secs: u64,
}

impl Default for ClosureConfig {
    fn default() -> Self {
        Self {
            remote: "origin".to_string(),
            trunk: "main".to_string(),
            cooldown_hours: 24,
            staleness_hours: 72,
            session_marker: ".fleet-session".to_string(),
            session_fresh_minutes: 120,
            review_budget: 3,
            archive: false,
            archive_dir: None,
            network_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GuardianConfig {
    /// Singleton-controller flag. Set on exactly one host by operator convention.
    pub controller: bool,
    /// Host name used in rescue branch names; defaults to the system hostname.
    pub host: Option<String>,
    /// Canonical clones guarded on this host.
    pub canonical: Vec<PathBuf>,
    pub rescue_prefix: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Claude,
    Codex,
    /// Arbitrary command; the prompt arrives on stdin.
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    /// Executable plus leading arguments.
    pub command: Vec<String>,
    /// Canonical models this provider accepts. Empty accepts any model.
    pub models: Vec<String>,
    /// Short names mapped to canonical models.
    pub aliases: BTreeMap<String, String>,
    pub default_model: Option<String>,
    /// Environment variable that must hold the provider credential.
    pub credential_env: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Command,
            command: Vec::new(),
            models: Vec::new(),
            aliases: BTreeMap::new(),
            default_model: None,
            credential_env: None,
        }
    }
}

impl Default for FleetConfig {
    fn default() -> Self {
        let mut providers = BTreeMap::new();
        providers.insert(
            "claude".to_string(),
            ProviderConfig {
                kind: ProviderKind::Claude,
                command: vec!["claude".to_string()],
                models: vec![
                    "claude-opus-4-1".to_string(),
                    "claude-sonnet-4-5".to_string(),
                ],
                aliases: BTreeMap::from([
                    ("opus".to_string(), "claude-opus-4-1".to_string()),
                    ("sonnet".to_string(), "claude-sonnet-4-5".to_string()),
                ]),
                default_model: Some("claude-opus-4-1".to_string()),
                credential_env: Some("ANTHROPIC_API_KEY".to_string()),
            },
        );
        providers.insert(
            "codex".to_string(),
            ProviderConfig {
                kind: ProviderKind::Codex,
                command: vec!["codex".to_string()],
                models: vec!["gpt-5-codex".to_string()],
                aliases: BTreeMap::new(),
                default_model: Some("gpt-5-codex".to_string()),
                credential_env: Some("OPENAI_API_KEY".to_string()),
            },
        );
        Self {
            scratch_root: None,
            jobs: JobsConfig::default(),
            closure: ClosureConfig::default(),
            guardian: GuardianConfig::default(),
            providers,
        }
    }
}

impl FleetConfig {
    pub fn validate(&self) -> Result<()> {
        if self.jobs.retry_ceiling == 0 {
            return Err(anyhow!("jobs.retry_ceiling must be > 0"));
        }
        if self.jobs.poll_interval_secs == 0 {
            return Err(anyhow!("jobs.poll_interval_secs must be > 0"));
        }
        if self.jobs.backoff_base_secs == 0 || self.jobs.backoff_max_secs == 0 {
            return Err(anyhow!("jobs backoff intervals must be > 0"));
        }
        if self.closure.network_timeout_secs == 0 {
            return Err(anyhow!("closure.network_timeout_secs must be > 0"));
        }
        if self.closure.trunk.trim().is_empty() {
            return Err(anyhow!("closure.trunk must not be empty"));
        }
        if self.closure.remote.trim().is_empty() {
            return Err(anyhow!("closure.remote must not be empty"));
        }
        if self.closure.session_marker.trim().is_empty() {
            return Err(anyhow!("closure.session_marker must not be empty"));
        }
        for (name, provider) in &self.providers {
            if provider.command.is_empty() || provider.command[0].trim().is_empty() {
                return Err(anyhow!(
                    "providers.{name}.command must be a non-empty array"
                ));
            }
        }
        Ok(())
    }

    /// Absolute scratch root for `home`.
    pub fn scratch_root(&self, home: &Path) -> PathBuf {
        match &self.scratch_root {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => home.join(p),
            None => home.join("worktrees"),
        }
    }

    pub fn archive_dir(&self, home: &Path) -> PathBuf {
        match &self.closure.archive_dir {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => home.join(p),
            None => home.join("archive"),
        }
    }

    pub fn closure_policy(&self) -> ClosurePolicy {
        ClosurePolicy {
            cooldown: hours(self.closure.cooldown_hours),
            staleness: hours(self.closure.staleness_hours),
            archive: self.closure.archive,
        }
    }

    pub fn session_fresh_for(&self) -> Duration {
        Duration::from_secs(self.closure.session_fresh_minutes * 60)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.closure.network_timeout_secs)
    }

    pub fn host(&self) -> String {
        if let Some(host) = &self.guardian.host {
            return host.clone();
        }
        nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string())
    }

    pub fn rescue_prefix(&self) -> &str {
        self.guardian.rescue_prefix.as_deref().unwrap_or("rescue")
    }
}

fn hours(h: u64) -> Duration {
    Duration::from_secs(h * 3600)
}

/// Resolve the fleet home: explicit flag, then `$FLEET_HOME` (handled by clap),
/// then `~/.fleet`.
pub fn resolve_home(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(home) = explicit {
        return Ok(home.to_path_buf());
    }
    let base = dirs::home_dir().ok_or_else(|| anyhow!("cannot determine home directory"))?;
    Ok(base.join(".fleet"))
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `FleetConfig::default()`.
pub fn load_config(path: &Path) -> Result<FleetConfig> {
    if !path.exists() {
        let cfg = FleetConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: FleetConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &FleetConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    crate::io::fsutil::write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, FleetConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = FleetConfig::default();
        cfg.guardian.controller = true;
        cfg.guardian.canonical = vec![PathBuf::from("/srv/canonical/app")];
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[closure]\ntrunk = \"develop\"\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.closure.trunk, "develop");
        assert_eq!(cfg.closure.remote, "origin");
        assert_eq!(cfg.jobs.retry_ceiling, 3);
        assert!(!cfg.guardian.controller);
    }

    #[test]
    fn rejects_empty_trunk_and_empty_provider_command() {
        let mut cfg = FleetConfig::default();
        cfg.closure.trunk = " ".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = FleetConfig::default();
        cfg.providers
            .insert("broken".to_string(), ProviderConfig::default());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn relative_paths_resolve_against_home() {
        let home = Path::new("/var/fleet");
        let mut cfg = FleetConfig::default();
        assert_eq!(cfg.scratch_root(home), home.join("worktrees"));
        cfg.scratch_root = Some(PathBuf::from("scratch"));
        assert_eq!(cfg.scratch_root(home), home.join("scratch"));
        assert_eq!(cfg.archive_dir(home), home.join("archive"));
    }
}
