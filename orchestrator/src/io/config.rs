//! Orchestrator configuration stored under `.orchestrator/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::core::types::Idempotency;
use crate::io::paths::write_atomic;

/// Orchestrator configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// the values in [`OrchestratorConfig::default`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Token budget for one compiled context packet.
    pub token_budget: usize,

    /// Plan/tool cycles allowed per turn before `CYCLE_LIMIT_EXCEEDED`.
    pub max_cycles: u32,

    pub planner_timeout_secs: u64,
    pub tool_timeout_secs: u64,

    /// Wall-clock budget for a whole invocation; caps every call timeout.
    pub invocation_timeout_secs: u64,

    pub recent_outcomes_limit: usize,
    pub recent_failures_limit: usize,
    pub evidence_limit: usize,
    pub memory_limit: usize,

    /// Truncate planner and command-tool stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Keep only the newest N checkpoints per thread after each invocation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_retention: Option<usize>,

    pub gate: GateConfig,
    pub planner: PlannerConfig,
    pub tools: Vec<ToolConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GateConfig {
    /// Minimum evidence items for request kinds absent from `min_evidence`.
    pub default_min_evidence: usize,
    /// Per request kind minimum evidence items.
    pub min_evidence: BTreeMap<String, usize>,
}

impl GateConfig {
    pub fn min_evidence_for(&self, request_kind: &str) -> usize {
        self.min_evidence
            .get(request_kind)
            .copied()
            .unwrap_or(self.default_min_evidence)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlannerConfig {
    /// Command that reads the rendered prompt on stdin and prints one decision
    /// as JSON on stdout (e.g. `["my-planner","--json"]`).
    pub command: Vec<String>,
}

/// A command-backed tool exposed to the planner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub idempotency: Idempotency,
    #[serde(default = "open_object_schema")]
    pub input_schema: Value,
    #[serde(default = "open_object_schema")]
    pub output_schema: Value,
}

fn open_object_schema() -> Value {
    json!({ "type": "object" })
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            token_budget: 6000,
            max_cycles: 5,
            planner_timeout_secs: 120,
            tool_timeout_secs: 60,
            invocation_timeout_secs: 30 * 60,
            recent_outcomes_limit: 5,
            recent_failures_limit: 5,
            evidence_limit: 10,
            memory_limit: 20,
            output_limit_bytes: 100_000,
            checkpoint_retention: None,
            gate: GateConfig::default(),
            planner: PlannerConfig::default(),
            tools: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_cycles == 0 {
            return Err(anyhow!("max_cycles must be > 0"));
        }
        if self.planner_timeout_secs == 0 {
            return Err(anyhow!("planner_timeout_secs must be > 0"));
        }
        if self.tool_timeout_secs == 0 {
            return Err(anyhow!("tool_timeout_secs must be > 0"));
        }
        if self.invocation_timeout_secs == 0 {
            return Err(anyhow!("invocation_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.checkpoint_retention == Some(0) {
            return Err(anyhow!("checkpoint_retention must be > 0 when set"));
        }
        if !self.planner.command.is_empty() && self.planner.command[0].trim().is_empty() {
            return Err(anyhow!("planner.command must not start with an empty program"));
        }
        for (index, tool) in self.tools.iter().enumerate() {
            if tool.name.trim().is_empty() {
                return Err(anyhow!("tools[{index}].name must be non-empty"));
            }
            if tool.command.is_empty() || tool.command[0].trim().is_empty() {
                return Err(anyhow!(
                    "tools[{index}] ({}) command must be a non-empty array",
                    tool.name
                ));
            }
            if self.tools[..index].iter().any(|t| t.name == tool.name) {
                return Err(anyhow!("duplicate tool name {}", tool.name));
            }
        }
        Ok(())
    }

    pub fn planner_timeout(&self) -> Duration {
        Duration::from_secs(self.planner_timeout_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_secs(self.invocation_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OrchestratorConfig::default()`.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    if !path.exists() {
        let cfg = OrchestratorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OrchestratorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &OrchestratorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, OrchestratorConfig::default());
        assert_eq!(cfg.token_budget, 6000);
        assert_eq!(cfg.max_cycles, 5);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = OrchestratorConfig {
            checkpoint_retention: Some(3),
            ..OrchestratorConfig::default()
        };
        cfg.gate.min_evidence.insert("claim_review".into(), 2);
        cfg.planner.command = vec!["planner".into(), "--json".into()];
        cfg.tools.push(ToolConfig {
            name: "lookup_total".into(),
            description: "Sum a ledger column".into(),
            command: vec!["lookup".into()],
            idempotency: Idempotency::Idempotent,
            input_schema: json!({"type": "object", "required": ["column"]}),
            output_schema: open_object_schema(),
        });
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults_and_parses_tools() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            r#"
max_cycles = 3

[gate]
default_min_evidence = 1

[gate.min_evidence]
claim_review = 4

[[tools]]
name = "record_note"
command = ["bin/record-note"]
idempotency = "non_idempotent"
"#,
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_cycles, 3);
        assert_eq!(cfg.token_budget, 6000);
        assert_eq!(cfg.gate.min_evidence_for("claim_review"), 4);
        assert_eq!(cfg.gate.min_evidence_for("general"), 1);
        assert_eq!(cfg.tools[0].idempotency, Idempotency::NonIdempotent);
        assert_eq!(cfg.tools[0].input_schema, open_object_schema());
    }

    #[test]
    fn validate_rejects_bad_values() {
        let zero_cycles = OrchestratorConfig {
            max_cycles: 0,
            ..OrchestratorConfig::default()
        };
        assert!(zero_cycles.validate().is_err());

        let mut duplicate = OrchestratorConfig::default();
        for _ in 0..2 {
            duplicate.tools.push(ToolConfig {
                name: "t".into(),
                description: String::new(),
                command: vec!["true".into()],
                idempotency: Idempotency::Idempotent,
                input_schema: open_object_schema(),
                output_schema: open_object_schema(),
            });
        }
        let err = duplicate.validate().expect_err("duplicate");
        assert!(err.to_string().contains("duplicate tool name"));
    }
}
