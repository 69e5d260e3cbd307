use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use berth_api::HttpConfig;
use berth_core::config::AgentConfig;
use berth_exec::ContainerizerConfig;
use berth_observe::LoggerConfig;

const REDACTED: &str = "<redacted>";

/// Everything `berth-agentd` reads from its config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DaemonConfig {
    pub agent: AgentConfig,
    pub containerizer: ContainerizerConfig,
    pub http: HttpConfig,
    pub logger: LoggerConfig,
    /// Controller endpoint, e.g. `controller@10.0.0.1:5050`. Without one the
    /// agent waits for a leader.
    pub controller: Option<String>,
    /// Checkpoint under `<workDir>/meta` and recover from it on start.
    pub recover: bool,
    /// Mint an authentication token for every executor.
    pub executor_tokens: bool,
}

impl DaemonConfig {
    /// Defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        config.agent.validate().context("agent section")?;
        Ok(config)
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.agent.work_dir.join("meta")
    }

    /// Effective configuration as served by `/flags`, without credential
    /// secrets.
    pub fn flags(&self) -> serde_json::Value {
        let mut shown = self.clone();
        for credential in &mut shown.http.credentials {
            credential.secret = REDACTED.to_string();
        }
        serde_json::to_value(shown).unwrap_or(serde_json::Value::Null)
    }
}
