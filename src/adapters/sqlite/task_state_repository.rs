//! SQLite implementation of the TaskStateRepository.

use async_trait::async_trait;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::adapters::sqlite::{parse_datetime, parse_json_or_default, parse_uuid};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{AgentState, EventType, TaskState, TransitionRecord};
use crate::domain::ports::TaskStateRepository;

#[derive(Clone)]
pub struct SqliteTaskStateRepository {
    pool: SqlitePool,
}

const UPDATE_STATE_SQL: &str = "UPDATE task_states
     SET current_state = ?, previous_state = ?, context_json = ?, state_entered_at = ?,
         transition_count = ?, updated_at = ?
     WHERE agent_name = ? AND task_id = ? AND transition_count = ?";

const INSERT_TRANSITION_SQL: &str = "INSERT INTO state_transitions
     (id, task_id, agent_name, from_state, to_state, event_type, payload_json, duration_ms, created_at)
     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)";

impl SqliteTaskStateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Classify an update that matched no row.
    async fn stale_update_error(&self, state: &TaskState) -> DomainError {
        match self.load(&state.agent_name, state.task_id).await {
            Ok(None) => DomainError::TaskStateNotFound {
                agent: state.agent_name.clone(),
                task_id: state.task_id,
            },
            Ok(Some(_)) => DomainError::ConcurrencyConflict {
                entity: "task_state".to_string(),
                id: format!("{}/{}", state.agent_name, state.task_id),
            },
            Err(e) => e,
        }
    }

    /// List every task state for an agent, most recently updated first.
    pub async fn list_by_agent(&self, agent_name: &str) -> DomainResult<Vec<TaskState>> {
        let rows: Vec<TaskStateRow> = sqlx::query_as(
            "SELECT agent_name, task_id, current_state, previous_state, context_json,
                    state_entered_at, transition_count, created_at, updated_at
             FROM task_states WHERE agent_name = ? ORDER BY updated_at DESC",
        )
        .bind(agent_name)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }
}

#[async_trait]
impl TaskStateRepository for SqliteTaskStateRepository {
    async fn load(&self, agent_name: &str, task_id: Uuid) -> DomainResult<Option<TaskState>> {
        let row: Option<TaskStateRow> = sqlx::query_as(
            "SELECT agent_name, task_id, current_state, previous_state, context_json,
                    state_entered_at, transition_count, created_at, updated_at
             FROM task_states WHERE agent_name = ? AND task_id = ?",
        )
        .bind(agent_name)
        .bind(task_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn insert(&self, state: &TaskState) -> DomainResult<()> {
        let context_json = serde_json::to_string(&state.context)?;

        let result = sqlx::query(
            "INSERT INTO task_states (agent_name, task_id, current_state, previous_state, context_json,
                                      state_entered_at, transition_count, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&state.agent_name)
        .bind(state.task_id.to_string())
        .bind(state.current_state.as_str())
        .bind(state.previous_state.map(|s| s.as_str()))
        .bind(&context_json)
        .bind(state.state_entered_at.to_rfc3339())
        .bind(state.transition_count as i64)
        .bind(state.created_at.to_rfc3339())
        .bind(state.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(DomainError::ConcurrencyConflict {
                    entity: "task_state".to_string(),
                    id: format!("{}/{}", state.agent_name, state.task_id),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, state: &TaskState, expected_version: u64) -> DomainResult<()> {
        let context_json = serde_json::to_string(&state.context)?;

        let result = sqlx::query(UPDATE_STATE_SQL)
            .bind(state.current_state.as_str())
            .bind(state.previous_state.map(|s| s.as_str()))
            .bind(&context_json)
            .bind(state.state_entered_at.to_rfc3339())
            .bind(state.transition_count as i64)
            .bind(state.updated_at.to_rfc3339())
            .bind(&state.agent_name)
            .bind(state.task_id.to_string())
            .bind(expected_version as i64)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }
        Err(self.stale_update_error(state).await)
    }

    async fn commit_transition(
        &self,
        state: &TaskState,
        expected_version: u64,
        record: &TransitionRecord,
    ) -> DomainResult<()> {
        let context_json = serde_json::to_string(&state.context)?;
        let payload_json = serde_json::to_string(&record.payload)?;
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(UPDATE_STATE_SQL)
            .bind(state.current_state.as_str())
            .bind(state.previous_state.map(|s| s.as_str()))
            .bind(&context_json)
            .bind(state.state_entered_at.to_rfc3339())
            .bind(state.transition_count as i64)
            .bind(state.updated_at.to_rfc3339())
            .bind(&state.agent_name)
            .bind(state.task_id.to_string())
            .bind(expected_version as i64)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(self.stale_update_error(state).await);
        }

        sqlx::query(INSERT_TRANSITION_SQL)
            .bind(record.id.to_string())
            .bind(record.task_id.to_string())
            .bind(&record.agent_name)
            .bind(record.from_state.as_str())
            .bind(record.to_state.as_str())
            .bind(record.event_type.as_str())
            .bind(&payload_json)
            .bind(record.duration_ms as i64)
            .bind(record.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn append_transition(&self, record: &TransitionRecord) -> DomainResult<()> {
        let payload_json = serde_json::to_string(&record.payload)?;

        sqlx::query(INSERT_TRANSITION_SQL)
            .bind(record.id.to_string())
            .bind(record.task_id.to_string())
            .bind(&record.agent_name)
            .bind(record.from_state.as_str())
            .bind(record.to_state.as_str())
            .bind(record.event_type.as_str())
            .bind(&payload_json)
            .bind(record.duration_ms as i64)
            .bind(record.created_at.to_rfc3339())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn list_transitions(
        &self,
        agent_name: &str,
        task_id: Uuid,
    ) -> DomainResult<Vec<TransitionRecord>> {
        let rows: Vec<TransitionRow> = sqlx::query_as(
            "SELECT id, task_id, agent_name, from_state, to_state, event_type, payload_json,
                    duration_ms, created_at
             FROM state_transitions WHERE agent_name = ? AND task_id = ? ORDER BY seq ASC",
        )
        .bind(agent_name)
        .bind(task_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }
}

// ============================================================================
// Row types for sqlx
// ============================================================================

#[derive(sqlx::FromRow)]
struct TaskStateRow {
    agent_name: String,
    task_id: String,
    current_state: String,
    previous_state: Option<String>,
    context_json: Option<String>,
    state_entered_at: String,
    transition_count: i64,
    created_at: String,
    updated_at: String,
}

impl TryFrom<TaskStateRow> for TaskState {
    type Error = DomainError;

    fn try_from(row: TaskStateRow) -> Result<Self, Self::Error> {
        Ok(Self {
            task_id: parse_uuid(&row.task_id)?,
            agent_name: row.agent_name,
            current_state: row.current_state.parse()?,
            previous_state: row
                .previous_state
                .map(|s| s.parse::<AgentState>())
                .transpose()?,
            context: parse_json_or_default(row.context_json)?,
            state_entered_at: parse_datetime(&row.state_entered_at)?,
            transition_count: row.transition_count.max(0) as u64,
            created_at: parse_datetime(&row.created_at)?,
            updated_at: parse_datetime(&row.updated_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TransitionRow {
    id: String,
    task_id: String,
    agent_name: String,
    from_state: String,
    to_state: String,
    event_type: String,
    payload_json: Option<String>,
    duration_ms: i64,
    created_at: String,
}

impl TryFrom<TransitionRow> for TransitionRecord {
    type Error = DomainError;

    fn try_from(row: TransitionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(&row.id)?,
            task_id: parse_uuid(&row.task_id)?,
            agent_name: row.agent_name,
            from_state: row.from_state.parse()?,
            to_state: row.to_state.parse()?,
            event_type: row.event_type.parse::<EventType>()?,
            payload: parse_json_or_default(row.payload_json)?,
            duration_ms: row.duration_ms.max(0) as u64,
            created_at: parse_datetime(&row.created_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::create_migrated_test_pool;
    use crate::domain::models::StateEvent;
    use serde_json::json;

    async fn setup() -> SqliteTaskStateRepository {
        let pool = create_migrated_test_pool().await.unwrap();
        SqliteTaskStateRepository::new(pool)
    }

    #[tokio::test]
    async fn test_insert_and_load() {
        let repo = setup().await;
        let state = TaskState::new("writer", Uuid::new_v4());
        repo.insert(&state).await.unwrap();

        let loaded = repo.load("writer", state.task_id).await.unwrap().unwrap();
        assert_eq!(loaded.current_state, AgentState::Idle);
        assert_eq!(loaded.transition_count, 0);
        assert!(repo.load("other", state.task_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_insert_conflicts() {
        let repo = setup().await;
        let state = TaskState::new("writer", Uuid::new_v4());
        repo.insert(&state).await.unwrap();
        assert!(matches!(
            repo.insert(&state).await,
            Err(DomainError::ConcurrencyConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_update_checks_version() {
        let repo = setup().await;
        let mut state = TaskState::new("writer", Uuid::new_v4());
        repo.insert(&state).await.unwrap();

        state.apply(&StateEvent::new(EventType::Start)).unwrap();
        repo.update(&state, 0).await.unwrap();

        // Stale writer still believes version 0.
        assert!(matches!(
            repo.update(&state, 0).await,
            Err(DomainError::ConcurrencyConflict { .. })
        ));

        let loaded = repo.load("writer", state.task_id).await.unwrap().unwrap();
        assert_eq!(loaded.current_state, AgentState::Initializing);
        assert_eq!(loaded.previous_state, Some(AgentState::Idle));
    }

    #[tokio::test]
    async fn test_commit_transition_is_atomic() {
        let repo = setup().await;
        let mut state = TaskState::new("writer", Uuid::new_v4());
        repo.insert(&state).await.unwrap();

        let record = state.apply(&StateEvent::new(EventType::Start)).unwrap();
        repo.commit_transition(&state, 0, &record).await.unwrap();

        // Replaying the same commit is stale: neither state nor audit changes.
        assert!(repo.commit_transition(&state, 0, &record).await.is_err());
        let history = repo.list_transitions("writer", state.task_id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, record.id);
    }

    #[tokio::test]
    async fn test_update_missing_row() {
        let repo = setup().await;
        let state = TaskState::new("writer", Uuid::new_v4());
        assert!(matches!(
            repo.update(&state, 0).await,
            Err(DomainError::TaskStateNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_transitions_roundtrip_in_order() {
        let repo = setup().await;
        let mut state = TaskState::new("writer", Uuid::new_v4());
        repo.insert(&state).await.unwrap();

        let first = state.apply(&StateEvent::new(EventType::Start)).unwrap();
        let second = state
            .apply(&StateEvent::new(EventType::Fail).with_payload(json!({"error": "boom"})))
            .unwrap();
        repo.append_transition(&first).await.unwrap();
        repo.append_transition(&second).await.unwrap();

        let history = repo.list_transitions("writer", state.task_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].event_type, EventType::Start);
        assert_eq!(history[1].to_state, AgentState::Failed);
        assert_eq!(history[1].payload, json!({"error": "boom"}));
    }
}
