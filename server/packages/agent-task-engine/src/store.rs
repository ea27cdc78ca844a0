//! Execution persistence. The engine only relies on the [`ExecutionStore`]
//! contract; two implementations ship with it.

use std::collections::HashMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};

use agent_task_engine_error::EngineError;

use crate::execution::{Execution, ExecutionStatus, TerminalUpdate};
use crate::transcript::LogEntry;

const RECORDS_DIR: &str = "executions";

#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    Running,
    Terminal(TerminalUpdate),
}

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub agent_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub limit: Option<usize>,
}

#[async_trait]
pub trait ExecutionStore: Send + Sync + Debug {
    /// Inserts a new record. Fails with `Conflict` if the id is taken.
    async fn create(&self, execution: Execution) -> Result<(), EngineError>;

    async fn get(&self, id: &str) -> Result<Option<Execution>, EngineError>;

    /// Newest first.
    async fn list(&self, filter: ListFilter) -> Result<Vec<Execution>, EngineError>;

    async fn append_log(&self, id: &str, entries: &[LogEntry]) -> Result<(), EngineError>;

    /// Applies a forward status transition atomically and returns the updated
    /// record. Backward or repeated terminal transitions fail with `Conflict`.
    async fn update_status(&self, id: &str, update: StatusUpdate)
        -> Result<Execution, EngineError>;
}

/// Transition rules shared by the store implementations.
#[derive(Debug, Default)]
struct ExecutionTable {
    records: HashMap<String, Execution>,
}

impl ExecutionTable {
    fn insert(&mut self, execution: Execution) -> Result<(), EngineError> {
        if self.records.contains_key(&execution.id) {
            return Err(EngineError::conflict(format!(
                "execution {} already exists",
                execution.id
            )));
        }
        self.records.insert(execution.id.clone(), execution);
        Ok(())
    }

    fn record_mut(&mut self, id: &str) -> Result<&mut Execution, EngineError> {
        self.records
            .get_mut(id)
            .ok_or_else(|| EngineError::execution_not_found(id))
    }

    fn list(&self, filter: &ListFilter) -> Vec<Execution> {
        let mut list: Vec<Execution> = self
            .records
            .values()
            .filter(|record| {
                filter
                    .agent_id
                    .as_deref()
                    .map_or(true, |agent_id| record.agent_id == agent_id)
            })
            .filter(|record| filter.status.map_or(true, |status| record.status == status))
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            list.truncate(limit);
        }
        list
    }

    fn append_log(&mut self, id: &str, entries: &[LogEntry]) -> Result<(), EngineError> {
        let record = self.record_mut(id)?;
        if record.status.is_terminal() {
            return Err(EngineError::conflict(format!(
                "execution {id} is {} and its log is sealed",
                record.status.as_str()
            )));
        }
        record.execution_log.extend_from_slice(entries);
        Ok(())
    }

    fn apply(&mut self, id: &str, update: StatusUpdate) -> Result<Execution, EngineError> {
        let record = self.record_mut(id)?;
        apply_update(record, update)?;
        Ok(record.clone())
    }
}

fn apply_update(record: &mut Execution, update: StatusUpdate) -> Result<(), EngineError> {
    let next = match &update {
        StatusUpdate::Running => ExecutionStatus::Running,
        StatusUpdate::Terminal(terminal) => terminal.status,
    };
    if !record.status.can_transition_to(next) {
        return Err(EngineError::conflict(format!(
            "execution {} cannot move from {} to {}",
            record.id,
            record.status.as_str(),
            next.as_str()
        )));
    }

    let now = Utc::now();
    match update {
        StatusUpdate::Running => {
            record.status = ExecutionStatus::Running;
            record.started_at = Some(now);
        }
        StatusUpdate::Terminal(terminal) => {
            let since = record.started_at.unwrap_or(record.created_at);
            record.status = terminal.status;
            record.response = terminal.response;
            record.error = terminal.error;
            record.error_type = terminal.error_type;
            if terminal.session_id.is_some() {
                record.session_id = terminal.session_id;
            }
            record.metadata = Some(terminal.metadata);
            record.completed_at = Some(now);
            record.duration_ms = Some((now - since).num_milliseconds().max(0) as u64);
        }
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct MemoryExecutionStore {
    table: RwLock<ExecutionTable>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn create(&self, execution: Execution) -> Result<(), EngineError> {
        self.table.write().await.insert(execution)
    }

    async fn get(&self, id: &str) -> Result<Option<Execution>, EngineError> {
        Ok(self.table.read().await.records.get(id).cloned())
    }

    async fn list(&self, filter: ListFilter) -> Result<Vec<Execution>, EngineError> {
        Ok(self.table.read().await.list(&filter))
    }

    async fn append_log(&self, id: &str, entries: &[LogEntry]) -> Result<(), EngineError> {
        self.table.write().await.append_log(id, entries)
    }

    async fn update_status(
        &self,
        id: &str,
        update: StatusUpdate,
    ) -> Result<Execution, EngineError> {
        self.table.write().await.apply(id, update)
    }
}

/// Keeps every record in memory and mirrors each one to its own JSON file
/// under `<dir>/executions`. Log appends stay in memory until the next status
/// transition persists them.
#[derive(Debug)]
pub struct FileExecutionStore {
    dir: PathBuf,
    table: RwLock<ExecutionTable>,
    /// Serializes writers. Readers only take `table`, which is never held
    /// across file I/O.
    writer: Mutex<()>,
}

impl FileExecutionStore {
    pub async fn open(dir: &Path) -> Result<Self, EngineError> {
        let records_dir = dir.join(RECORDS_DIR);
        tokio::fs::create_dir_all(&records_dir).await.map_err(|err| {
            EngineError::persistence(format!(
                "failed to create data directory {}: {err}",
                records_dir.display()
            ))
        })?;

        let mut table = ExecutionTable::default();
        let mut entries = tokio::fs::read_dir(&records_dir).await.map_err(|err| {
            EngineError::persistence(format!("failed to list {}: {err}", records_dir.display()))
        })?;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    return Err(EngineError::persistence(format!(
                        "failed to list {}: {err}",
                        records_dir.display()
                    )))
                }
            };
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let parsed = tokio::fs::read(&path)
                .await
                .map_err(|err| err.to_string())
                .and_then(|bytes| {
                    serde_json::from_slice::<Execution>(&bytes).map_err(|err| err.to_string())
                });
            match parsed {
                Ok(record) => {
                    table.records.insert(record.id.clone(), record);
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping unreadable execution file");
                }
            }
        }
        tracing::info!(
            path = %records_dir.display(),
            executions = table.records.len(),
            "loaded execution state"
        );

        Ok(Self {
            dir: records_dir,
            table: RwLock::new(table),
            writer: Mutex::new(()),
        })
    }

    /// Directory holding one file per execution.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    async fn persist(&self, record: &Execution) -> Result<(), EngineError> {
        let bytes = serde_json::to_vec(record).map_err(|err| {
            EngineError::persistence(format!("failed to encode execution {}: {err}", record.id))
        })?;
        let path = self.record_path(&record.id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await.map_err(|err| {
            EngineError::persistence(format!("failed to write {}: {err}", tmp.display()))
        })?;
        tokio::fs::rename(&tmp, &path).await.map_err(|err| {
            EngineError::persistence(format!("failed to replace {}: {err}", path.display()))
        })
    }
}

#[async_trait]
impl ExecutionStore for FileExecutionStore {
    async fn create(&self, execution: Execution) -> Result<(), EngineError> {
        let _writer = self.writer.lock().await;
        if self.table.read().await.records.contains_key(&execution.id) {
            return Err(EngineError::conflict(format!(
                "execution {} already exists",
                execution.id
            )));
        }
        self.persist(&execution).await?;
        self.table.write().await.insert(execution)
    }

    async fn get(&self, id: &str) -> Result<Option<Execution>, EngineError> {
        Ok(self.table.read().await.records.get(id).cloned())
    }

    async fn list(&self, filter: ListFilter) -> Result<Vec<Execution>, EngineError> {
        Ok(self.table.read().await.list(&filter))
    }

    async fn append_log(&self, id: &str, entries: &[LogEntry]) -> Result<(), EngineError> {
        let _writer = self.writer.lock().await;
        self.table.write().await.append_log(id, entries)
    }

    async fn update_status(
        &self,
        id: &str,
        update: StatusUpdate,
    ) -> Result<Execution, EngineError> {
        let _writer = self.writer.lock().await;
        let mut record = self
            .table
            .read()
            .await
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::execution_not_found(id))?;
        apply_update(&mut record, update)?;
        // Only a persisted transition becomes visible.
        self.persist(&record).await?;
        self.table
            .write()
            .await
            .records
            .insert(record.id.clone(), record.clone());
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{ExecutionMetadata, RequestMode, TaskRequest};
    use agent_task_engine_error::ErrorType;

    fn execution(id: &str, agent_id: &str) -> Execution {
        let request = TaskRequest::new("hello", RequestMode::Parallel);
        Execution::new(id.to_string(), agent_id.to_string(), &request, 60)
    }

    #[tokio::test]
    async fn create_rejects_duplicate_ids() {
        let store = MemoryExecutionStore::new();
        store.create(execution("e1", "a")).await.unwrap();
        let err = store.create(execution("e1", "a")).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict { .. }));
    }

    #[tokio::test]
    async fn transitions_are_forward_only_and_terminal_once() {
        let store = MemoryExecutionStore::new();
        store.create(execution("e1", "a")).await.unwrap();

        let running = store.update_status("e1", StatusUpdate::Running).await.unwrap();
        assert_eq!(running.status, ExecutionStatus::Running);
        assert!(running.started_at.is_some());

        let done = store
            .update_status(
                "e1",
                StatusUpdate::Terminal(TerminalUpdate::success(
                    Some("4".to_string()),
                    ExecutionMetadata::default(),
                )),
            )
            .await
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Success);
        assert_eq!(done.response.as_deref(), Some("4"));
        assert!(done.completed_at.is_some());
        assert!(done.duration_ms.is_some());

        let again = store
            .update_status(
                "e1",
                StatusUpdate::Terminal(TerminalUpdate::failed(ErrorType::Process, "late")),
            )
            .await
            .unwrap_err();
        assert!(matches!(again, EngineError::Conflict { .. }));
        let stored = store.get("e1").await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Success);
        assert!(stored.error.is_none());

        let err = store.append_log("e1", &[]).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict { .. }));
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let store = MemoryExecutionStore::new();
        assert!(store.get("missing").await.unwrap().is_none());
        let err = store
            .update_status("missing", StatusUpdate::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn list_filters_by_agent_newest_first() {
        let store = MemoryExecutionStore::new();
        store.create(execution("e1", "a")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.create(execution("e2", "b")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.create(execution("e3", "a")).await.unwrap();

        let listed = store
            .list(ListFilter {
                agent_id: Some("a".to_string()),
                ..ListFilter::default()
            })
            .await
            .unwrap();
        let ids: Vec<&str> = listed.iter().map(|record| record.id.as_str()).collect();
        assert_eq!(ids, vec!["e3", "e1"]);
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileExecutionStore::open(dir.path()).await.unwrap();
            store.create(execution("e1", "a")).await.unwrap();
            store.update_status("e1", StatusUpdate::Running).await.unwrap();
        }

        let reopened = FileExecutionStore::open(dir.path()).await.unwrap();
        let record = reopened.get("e1").await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Running);
        assert_eq!(record.message, "hello");
        assert!(reopened.path().join("e1.json").exists());
    }

    #[tokio::test]
    async fn file_store_writes_one_file_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileExecutionStore::open(dir.path()).await.unwrap();
        store.create(execution("e1", "a")).await.unwrap();
        store.create(execution("e2", "b")).await.unwrap();
        store.update_status("e2", StatusUpdate::Running).await.unwrap();

        let mut names: Vec<_> = std::fs::read_dir(store.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, vec!["e1.json", "e2.json"]);

        let e1: Execution =
            serde_json::from_slice(&std::fs::read(store.path().join("e1.json")).unwrap()).unwrap();
        assert_eq!(e1.status, ExecutionStatus::Pending);
        let e2: Execution =
            serde_json::from_slice(&std::fs::read(store.path().join("e2.json")).unwrap()).unwrap();
        assert_eq!(e2.status, ExecutionStatus::Running);
    }

    #[tokio::test]
    async fn file_store_skips_unreadable_files() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileExecutionStore::open(dir.path()).await.unwrap();
            store.create(execution("e1", "a")).await.unwrap();
            std::fs::write(store.path().join("broken.json"), b"{not json").unwrap();
        }
        let reopened = FileExecutionStore::open(dir.path()).await.unwrap();
        let all = reopened.list(ListFilter::default()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "e1");
    }

    #[tokio::test]
    async fn file_store_rejects_pending_to_failed() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileExecutionStore::open(dir.path()).await.unwrap();
        store.create(execution("e1", "a")).await.unwrap();
        let err = store
            .update_status(
                "e1",
                StatusUpdate::Terminal(TerminalUpdate::failed(ErrorType::Terminated, "stop")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict { .. }));
        let record = store.get("e1").await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Pending);
    }
}
