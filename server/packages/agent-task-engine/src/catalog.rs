use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use agent_task_engine_error::EngineError;

/// How to launch one agent's CLI.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentSpec {
    pub id: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub ready: bool,
}

impl AgentSpec {
    pub fn new(id: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            ready: true,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct AgentInfo {
    pub id: String,
    pub command: String,
    pub ready: bool,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("invalid agent catalog json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("failed to read agent catalog {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("agent '{0}' is defined more than once")]
    DuplicateAgent(String),
    #[error("agent '{0}' has an empty command")]
    EmptyCommand(String),
}

/// Agents the engine may dispatch to, keyed by id.
#[derive(Debug, Default)]
pub struct AgentCatalog {
    agents: RwLock<HashMap<String, AgentSpec>>,
}

impl AgentCatalog {
    pub fn new(specs: impl IntoIterator<Item = AgentSpec>) -> Result<Self, CatalogError> {
        let mut agents = HashMap::new();
        for spec in specs {
            if spec.program.as_os_str().is_empty() {
                return Err(CatalogError::EmptyCommand(spec.id));
            }
            if agents.contains_key(&spec.id) {
                return Err(CatalogError::DuplicateAgent(spec.id));
            }
            agents.insert(spec.id.clone(), spec);
        }
        Ok(Self {
            agents: RwLock::new(agents),
        })
    }

    /// Parses `{"agents": [{"id", "command", "args", "env", "cwd", "ready"}]}`.
    pub fn from_json(blob: &str) -> Result<Self, CatalogError> {
        let doc: CatalogDocument = serde_json::from_str(blob)?;
        Self::new(doc.agents.into_iter().map(|entry| AgentSpec {
            id: entry.id,
            program: PathBuf::from(entry.command),
            args: entry.args,
            env: entry.env,
            cwd: entry.cwd,
            ready: entry.ready,
        }))
    }

    pub fn from_file(path: &Path) -> Result<Self, CatalogError> {
        let blob = std::fs::read_to_string(path).map_err(|source| CatalogError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&blob)
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentSpec> {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent_id)
            .cloned()
    }

    /// Resolves an agent that can take work right now.
    pub fn resolve(&self, agent_id: &str) -> Result<AgentSpec, EngineError> {
        let spec = self
            .get(agent_id)
            .ok_or_else(|| EngineError::agent_not_found(agent_id))?;
        if !spec.ready {
            return Err(EngineError::conflict(format!("agent {agent_id} is not ready")));
        }
        Ok(spec)
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(agent_id)
    }

    pub fn set_ready(&self, agent_id: &str, ready: bool) -> Result<(), EngineError> {
        let mut agents = self.agents.write().unwrap_or_else(PoisonError::into_inner);
        let spec = agents
            .get_mut(agent_id)
            .ok_or_else(|| EngineError::agent_not_found(agent_id))?;
        spec.ready = ready;
        Ok(())
    }

    pub fn list(&self) -> Vec<AgentInfo> {
        let agents = self.agents.read().unwrap_or_else(PoisonError::into_inner);
        let mut list: Vec<AgentInfo> = agents
            .values()
            .map(|spec| AgentInfo {
                id: spec.id.clone(),
                command: spec.program.display().to_string(),
                ready: spec.ready,
            })
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }
}

#[derive(Debug, Deserialize)]
struct CatalogDocument {
    agents: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    id: String,
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    cwd: Option<PathBuf>,
    #[serde(default = "default_ready")]
    ready: bool,
}

fn default_ready() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_catalog_document() {
        let catalog = AgentCatalog::from_json(
            r#"{"agents":[
                {"id":"writer","command":"claude","env":{"FOO":"bar"}},
                {"id":"idle","command":"claude","args":["--debug"],"ready":false}
            ]}"#,
        )
        .unwrap();

        let writer = catalog.get("writer").unwrap();
        assert_eq!(writer.program, PathBuf::from("claude"));
        assert!(writer.ready);
        assert_eq!(writer.env.get("FOO").map(String::as_str), Some("bar"));

        let idle = catalog.get("idle").unwrap();
        assert_eq!(idle.args, vec!["--debug".to_string()]);
        assert!(!idle.ready);

        let ids: Vec<String> = catalog.list().into_iter().map(|agent| agent.id).collect();
        assert_eq!(ids, vec!["idle".to_string(), "writer".to_string()]);
    }

    #[test]
    fn rejects_duplicates_and_empty_commands() {
        let err = AgentCatalog::from_json(
            r#"{"agents":[{"id":"a","command":"x"},{"id":"a","command":"y"}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, CatalogError::DuplicateAgent(id) if id == "a"));

        let err = AgentCatalog::from_json(r#"{"agents":[{"id":"a","command":""}]}"#).unwrap_err();
        assert!(matches!(err, CatalogError::EmptyCommand(_)));
    }

    #[test]
    fn resolve_checks_existence_and_readiness() {
        let catalog = AgentCatalog::new([AgentSpec::new("a", "sh")]).unwrap();
        assert!(catalog.resolve("a").is_ok());

        let err = catalog.resolve("missing").unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));

        catalog.set_ready("a", false).unwrap();
        let err = catalog.resolve("a").unwrap_err();
        assert!(matches!(err, EngineError::Conflict { .. }));
    }
}
