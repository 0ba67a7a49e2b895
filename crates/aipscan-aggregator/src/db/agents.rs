use super::{Agent, Store};
use crate::error::{AggregatorError, Result};
use crate::ingest::mets::AgentRecord;
use sqlx::SqliteConnection;
use tracing::debug;

/// Lookup/insert rounds before giving up on a contended agent.
const UPSERT_ATTEMPTS: usize = 3;

/// Find or create the agent for `(storage_service_id, linking_type_value)`.
///
/// Lookup first, insert on a miss, and look up again when the insert loses
/// a race against another writer on the unique index.
pub(crate) async fn upsert_agent_on(
    conn: &mut SqliteConnection,
    agent: &AgentRecord,
    storage_service_id: i64,
) -> Result<i64> {
    for attempt in 1..=UPSERT_ATTEMPTS {
        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM agents WHERE storage_service_id = ? AND linking_type_value = ?",
        )
        .bind(storage_service_id)
        .bind(&agent.linking_type_value)
        .fetch_optional(&mut *conn)
        .await?;

        if let Some(id) = existing {
            return Ok(id);
        }

        let inserted = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO agents (linking_type_value, agent_type, agent_value, storage_service_id)
            VALUES (?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&agent.linking_type_value)
        .bind(&agent.agent_type)
        .bind(&agent.agent_value)
        .bind(storage_service_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(AggregatorError::from);

        match inserted {
            Ok(id) => return Ok(id),
            Err(e) if e.is_unique_violation() => {
                debug!(
                    attempt,
                    linking_type_value = %agent.linking_type_value,
                    "Agent inserted concurrently, looking it up again"
                );
            },
            Err(e) => return Err(e),
        }
    }

    Err(AggregatorError::not_found("agent", &agent.linking_type_value))
}

impl Store {
    pub async fn upsert_agent(&self, agent: &AgentRecord, storage_service_id: i64) -> Result<Agent> {
        let mut conn = self.pool.acquire().await?;
        let id = upsert_agent_on(&mut conn, agent, storage_service_id).await?;

        let agent = sqlx::query_as::<_, Agent>(
            "SELECT id, linking_type_value, agent_type, agent_value, storage_service_id \
             FROM agents WHERE id = ?",
        )
        .bind(id)
        .fetch_one(&mut *conn)
        .await?;
        Ok(agent)
    }

    pub async fn agents_for_storage_service(&self, storage_service_id: i64) -> Result<Vec<Agent>> {
        let agents = sqlx::query_as::<_, Agent>(
            "SELECT id, linking_type_value, agent_type, agent_value, storage_service_id \
             FROM agents WHERE storage_service_id = ? ORDER BY id",
        )
        .bind(storage_service_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(agents)
    }

    pub async fn agents_for_event(&self, event_id: i64) -> Result<Vec<Agent>> {
        let agents = sqlx::query_as::<_, Agent>(
            r#"
            SELECT a.id, a.linking_type_value, a.agent_type, a.agent_value, a.storage_service_id
            FROM agents a
            JOIN event_agents ea ON ea.agent_id = a.id
            WHERE ea.event_id = ?
            ORDER BY a.id
            "#,
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(agents)
    }
}
