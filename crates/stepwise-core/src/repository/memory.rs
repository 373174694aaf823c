//! In-process store backed by `DashMap`.
//!
//! Enforces the same uniqueness constraints as the SQLite store so the engine
//! behaves identically in tests and embedded use. Secondary index maps are
//! written through the `entry` API, which holds the shard lock while the
//! primary row is inserted.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use stepwise_types::definition::{Definition, DefinitionStatus};
use stepwise_types::dlq::DlqEntry;
use stepwise_types::error::RepositoryError;
use stepwise_types::execution::{Execution, ExecutionStatus, StepExecution, StepStatus};
use uuid::Uuid;

use super::definition::DefinitionRepository;
use super::dlq::DlqRepository;
use super::execution::{ExecutionRepository, StepOutcome};

type DefinitionKey = (String, String, u32);
type AttemptKey = (Uuid, String, u32);

#[derive(Debug, Default)]
pub struct InMemoryStore {
    definitions: DashMap<DefinitionKey, Definition>,
    executions: DashMap<Uuid, Execution>,
    execution_keys: DashMap<(String, String), Uuid>,
    attempts: DashMap<Uuid, StepExecution>,
    attempt_keys: DashMap<AttemptKey, Uuid>,
    dlq: DashMap<Uuid, DlqEntry>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn attempts_of(&self, execution_id: &Uuid) -> Vec<StepExecution> {
        self.attempts
            .iter()
            .filter(|r| r.value().execution_id == *execution_id)
            .map(|r| r.value().clone())
            .collect()
    }
}

fn definition_key(tenant_id: &str, code: &str, version: u32) -> DefinitionKey {
    (tenant_id.to_string(), code.to_string(), version)
}

impl DefinitionRepository for InMemoryStore {
    async fn insert_definition(&self, def: &Definition) -> Result<bool, RepositoryError> {
        match self
            .definitions
            .entry(definition_key(&def.tenant_id, &def.code, def.version))
        {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(def.clone());
                Ok(true)
            }
        }
    }

    async fn replace_draft_definition(&self, def: &Definition) -> Result<bool, RepositoryError> {
        let key = definition_key(&def.tenant_id, &def.code, def.version);
        match self.definitions.get_mut(&key) {
            Some(mut stored) if stored.status == DefinitionStatus::Draft => {
                let created_at = stored.created_at;
                *stored = def.clone();
                stored.status = DefinitionStatus::Draft;
                stored.published_at = None;
                stored.created_at = created_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_definition(
        &self,
        tenant_id: &str,
        code: &str,
        version: u32,
    ) -> Result<Option<Definition>, RepositoryError> {
        Ok(self
            .definitions
            .get(&definition_key(tenant_id, code, version))
            .map(|r| r.value().clone()))
    }

    async fn list_definitions(&self, tenant_id: &str) -> Result<Vec<Definition>, RepositoryError> {
        let mut defs: Vec<Definition> = self
            .definitions
            .iter()
            .filter(|r| r.value().tenant_id == tenant_id)
            .map(|r| r.value().clone())
            .collect();
        defs.sort_by(|a, b| a.code.cmp(&b.code).then(a.version.cmp(&b.version)));
        Ok(defs)
    }

    async fn transition_definition_status(
        &self,
        tenant_id: &str,
        code: &str,
        version: u32,
        from: DefinitionStatus,
        to: DefinitionStatus,
        published_at: Option<DateTime<Utc>>,
    ) -> Result<bool, RepositoryError> {
        match self
            .definitions
            .get_mut(&definition_key(tenant_id, code, version))
        {
            Some(mut stored) if stored.status == from => {
                stored.status = to;
                if published_at.is_some() {
                    stored.published_at = published_at;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

impl ExecutionRepository for InMemoryStore {
    async fn insert_execution(&self, execution: &Execution) -> Result<bool, RepositoryError> {
        let key = (
            execution.tenant_id.clone(),
            execution.idempotency_key.clone(),
        );
        match self.execution_keys.entry(key) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                self.executions.insert(execution.id, execution.clone());
                slot.insert(execution.id);
                Ok(true)
            }
        }
    }

    async fn get_execution(
        &self,
        tenant_id: &str,
        execution_id: &Uuid,
    ) -> Result<Option<Execution>, RepositoryError> {
        Ok(self
            .executions
            .get(execution_id)
            .filter(|r| r.value().tenant_id == tenant_id)
            .map(|r| r.value().clone()))
    }

    async fn get_execution_by_key(
        &self,
        tenant_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<Execution>, RepositoryError> {
        let id = self
            .execution_keys
            .get(&(tenant_id.to_string(), idempotency_key.to_string()))
            .map(|r| *r.value());
        match id {
            Some(id) => Ok(self.executions.get(&id).map(|r| r.value().clone())),
            None => Ok(None),
        }
    }

    async fn list_executions(
        &self,
        tenant_id: &str,
        status: Option<ExecutionStatus>,
        limit: u32,
    ) -> Result<Vec<Execution>, RepositoryError> {
        let mut rows: Vec<Execution> = self
            .executions
            .iter()
            .filter(|r| r.value().tenant_id == tenant_id)
            .filter(|r| status.is_none_or(|s| r.value().status == s))
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn update_execution_status(
        &self,
        tenant_id: &str,
        execution_id: &Uuid,
        status: ExecutionStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        match self.executions.get_mut(execution_id) {
            Some(mut row) if row.tenant_id == tenant_id && !row.status.is_terminal() => {
                row.status = status;
                row.updated_at = now;
                if status.is_terminal() {
                    row.finished_at = Some(now);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_step_attempt(&self, attempt: &StepExecution) -> Result<bool, RepositoryError> {
        let key = (
            attempt.execution_id,
            attempt.step_id.clone(),
            attempt.attempt_number,
        );
        match self.attempt_keys.entry(key) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                self.attempts.insert(attempt.id, attempt.clone());
                slot.insert(attempt.id);
                Ok(true)
            }
        }
    }

    async fn get_step_attempt(
        &self,
        attempt_id: &Uuid,
    ) -> Result<Option<StepExecution>, RepositoryError> {
        Ok(self.attempts.get(attempt_id).map(|r| r.value().clone()))
    }

    async fn latest_step_attempt(
        &self,
        execution_id: &Uuid,
        step_id: &str,
    ) -> Result<Option<StepExecution>, RepositoryError> {
        Ok(self
            .attempts_of(execution_id)
            .into_iter()
            .filter(|a| a.step_id == step_id)
            .max_by_key(|a| a.attempt_number))
    }

    async fn list_step_attempts(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<StepExecution>, RepositoryError> {
        let mut rows = self.attempts_of(execution_id);
        rows.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.attempt_number.cmp(&b.attempt_number))
                .then(a.id.cmp(&b.id))
        });
        Ok(rows)
    }

    async fn claim_step_attempt(
        &self,
        attempt_id: &Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        match self.attempts.get_mut(attempt_id) {
            Some(mut row) if row.status == StepStatus::Pending => {
                row.status = StepStatus::Running;
                row.started_at = Some(started_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_step_outcome(
        &self,
        attempt_id: &Uuid,
        outcome: &StepOutcome,
    ) -> Result<bool, RepositoryError> {
        match self.attempts.get_mut(attempt_id) {
            Some(mut row) if row.status == StepStatus::Running => {
                outcome.apply_to(&mut row);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_due_retries(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<StepExecution>, RepositoryError> {
        // Snapshot first: nested iteration over one DashMap can deadlock.
        let all: Vec<StepExecution> = self.attempts.iter().map(|r| r.value().clone()).collect();

        let mut due: Vec<StepExecution> = all
            .iter()
            .filter(|a| a.is_due(now))
            .filter(|a| {
                !all.iter().any(|b| {
                    b.execution_id == a.execution_id
                        && b.step_id == a.step_id
                        && b.attempt_number > a.attempt_number
                })
            })
            .filter(|a| {
                self.executions
                    .get(&a.execution_id)
                    .is_some_and(|e| !e.value().status.is_terminal())
            })
            .cloned()
            .collect();
        due.sort_by_key(|a| a.retry_after_at);
        due.truncate(limit as usize);
        Ok(due)
    }
}

impl DlqRepository for InMemoryStore {
    async fn insert_dlq_entry(&self, entry: &DlqEntry) -> Result<bool, RepositoryError> {
        match self.dlq.entry(entry.step_execution_id) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(entry.clone());
                Ok(true)
            }
        }
    }

    async fn get_dlq_entry_for_attempt(
        &self,
        step_execution_id: &Uuid,
    ) -> Result<Option<DlqEntry>, RepositoryError> {
        Ok(self.dlq.get(step_execution_id).map(|r| r.value().clone()))
    }

    async fn list_dlq_entries(
        &self,
        tenant_id: &str,
        limit: u32,
    ) -> Result<Vec<DlqEntry>, RepositoryError> {
        let mut rows: Vec<DlqEntry> = self
            .dlq
            .iter()
            .filter(|r| r.value().tenant_id == tenant_id)
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit as usize);
        Ok(rows)
    }
}
