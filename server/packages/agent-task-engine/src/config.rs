use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_TIMEOUT_SECS: u64 = 900;
pub const MAX_TIMEOUT_SECS: u64 = 7200;
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub default_timeout_secs: u64,
    pub max_timeout_secs: u64,
    /// How long to keep draining output after a forced kill.
    pub kill_grace: Duration,
    /// `None` keeps executions in memory only.
    pub data_dir: Option<PathBuf>,
    pub reap_on_start: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_timeout_secs: MAX_TIMEOUT_SECS,
            kill_grace: DEFAULT_KILL_GRACE,
            data_dir: None,
            reap_on_start: true,
        }
    }
}

pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("agent-task-engine"))
        .unwrap_or_else(|| PathBuf::from(".agent-task-engine"))
}
