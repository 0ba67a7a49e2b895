use super::agents::upsert_agent_on;
use super::{Aip, Event, File, FileType, NewAip, Store};
use crate::error::Result;
use crate::ingest::mets::{FileEntry, ParsedMets, PremisEvent};
use sqlx::{Row, SqliteConnection};
use std::collections::HashMap;
use tracing::{debug, warn};

const FILE_COLUMNS: &str = "id, aip_id, uuid, name, filepath, size, date_created, puid, \
     file_format, format_version, checksum_type, checksum_value, file_type, original_file_id";

impl Store {
    pub async fn get_aip(&self, id: i64) -> Result<Option<Aip>> {
        let aip = sqlx::query_as::<_, Aip>("SELECT * FROM aips WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(aip)
    }

    pub async fn find_aip_by_sha256(&self, mets_sha256: &str) -> Result<Option<Aip>> {
        let aip = sqlx::query_as::<_, Aip>("SELECT * FROM aips WHERE mets_sha256 = ?")
            .bind(mets_sha256)
            .fetch_optional(&self.pool)
            .await?;
        Ok(aip)
    }

    pub async fn aips_by_uuid(&self, uuid: &str) -> Result<Vec<Aip>> {
        let aips = sqlx::query_as::<_, Aip>("SELECT * FROM aips WHERE uuid = ? ORDER BY id")
            .bind(uuid)
            .fetch_all(&self.pool)
            .await?;
        Ok(aips)
    }

    pub async fn count_aips(&self) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM aips")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Delete every AIP row with `uuid`; files, events and event links
    /// follow through the cascade. Agents are left alone.
    pub async fn delete_aips_by_uuid(&self, uuid: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM aips WHERE uuid = ?")
            .bind(uuid)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Replace every AIP row sharing `aip.uuid` with the parsed METS, in one
    /// transaction.
    ///
    /// Originals are written before preservation copies so a copy can point
    /// at the original it was normalized from.
    pub async fn replace_aip(&self, aip: &NewAip, mets: &ParsedMets) -> Result<Aip> {
        let mut tx = self.pool.begin().await?;

        let replaced = sqlx::query("DELETE FROM aips WHERE uuid = ?")
            .bind(&aip.uuid)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if replaced > 0 {
            debug!(uuid = %aip.uuid, replaced, "Removed previous AIP rows");
        }

        let aip_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO aips (
                uuid, transfer_name, create_date, mets_sha256, size,
                storage_service_id, storage_location_id, fetch_job_id, origin_pipeline_id
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&aip.uuid)
        .bind(&aip.transfer_name)
        .bind(aip.create_date)
        .bind(&aip.mets_sha256)
        .bind(aip.size)
        .bind(aip.storage_service_id)
        .bind(aip.storage_location_id)
        .bind(aip.fetch_job_id)
        .bind(aip.origin_pipeline_id)
        .fetch_one(&mut *tx)
        .await?;

        let mut agent_ids = HashMap::with_capacity(mets.agents.len());
        for agent in &mets.agents {
            let id = upsert_agent_on(&mut tx, agent, aip.storage_service_id).await?;
            agent_ids.insert(agent.linking_type_value.as_str(), id);
        }

        let mut originals: HashMap<&str, i64> = HashMap::new();
        for entry in mets.originals() {
            let file_id = insert_file(&mut tx, aip_id, entry, FileType::Original, None).await?;
            insert_events(&mut tx, file_id, &entry.events, &agent_ids).await?;
            originals.insert(entry.uuid.as_str(), file_id);
        }

        let mut copies = 0i64;
        for entry in mets.preservation_files() {
            let original_file_id = entry
                .premis
                .related_uuid
                .as_deref()
                .and_then(|uuid| originals.get(uuid).copied());
            if original_file_id.is_none() {
                debug!(uuid = %entry.uuid, "Preservation file has no resolvable original");
            }

            let file_id =
                insert_file(&mut tx, aip_id, entry, FileType::Preservation, original_file_id)
                    .await?;
            insert_events(&mut tx, file_id, &entry.events, &agent_ids).await?;
            copies += 1;
        }

        sqlx::query("UPDATE aips SET originals_count = ?, copies_count = ? WHERE id = ?")
            .bind(originals.len() as i64)
            .bind(copies)
            .bind(aip_id)
            .execute(&mut *tx)
            .await?;

        let stored = sqlx::query_as::<_, Aip>("SELECT * FROM aips WHERE id = ?")
            .bind(aip_id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(stored)
    }

    pub async fn files_for_aip(&self, aip_id: i64) -> Result<Vec<File>> {
        let files = sqlx::query_as::<_, File>(&format!(
            "SELECT {} FROM files WHERE aip_id = ? ORDER BY id",
            FILE_COLUMNS
        ))
        .bind(aip_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(files)
    }

    pub async fn events_for_file(&self, file_id: i64) -> Result<Vec<Event>> {
        let events = sqlx::query_as::<_, Event>(
            "SELECT id, file_id, event_type, uuid, date, detail, outcome, outcome_detail \
             FROM events WHERE file_id = ? ORDER BY id",
        )
        .bind(file_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    /// Raw PREMIS object XML of a file.
    ///
    /// The column may hold text or a blob depending on who wrote it; both
    /// come back as text.
    pub async fn premis_object(&self, file_id: i64) -> Result<Option<String>> {
        let row = sqlx::query("SELECT CAST(premis_object AS BLOB) AS premis FROM files WHERE id = ?")
            .bind(file_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let bytes: Option<Vec<u8>> = row.try_get("premis")?;
        Ok(bytes.map(premis_text))
    }

    /// Row counts used to check that nothing outlives a cascade.
    pub async fn orphan_counts(&self) -> Result<(i64, i64)> {
        let files: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM files WHERE aip_id NOT IN (SELECT id FROM aips)",
        )
        .fetch_one(&self.pool)
        .await?;
        let events: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM events WHERE file_id NOT IN (SELECT id FROM files)",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok((files, events))
    }
}

fn premis_text(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => {
            warn!("PREMIS object is not valid UTF-8, replacing invalid sequences");
            String::from_utf8_lossy(e.as_bytes()).into_owned()
        },
    }
}

async fn insert_file(
    conn: &mut SqliteConnection,
    aip_id: i64,
    entry: &FileEntry,
    file_type: FileType,
    original_file_id: Option<i64>,
) -> Result<i64> {
    let premis = &entry.premis;
    let id = sqlx::query_scalar(
        r#"
        INSERT INTO files (
            aip_id, uuid, name, filepath, size, date_created, puid, file_format,
            format_version, checksum_type, checksum_value, file_type, premis_object,
            original_file_id
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(aip_id)
    .bind(&entry.uuid)
    .bind(&entry.label)
    .bind(&entry.filepath)
    .bind(premis.size)
    .bind(entry.date_created())
    .bind(&premis.puid)
    .bind(&premis.format_name)
    .bind(&premis.format_version)
    .bind(&premis.checksum_type)
    .bind(&premis.checksum_value)
    .bind(file_type.as_str())
    .bind(&entry.premis_xml)
    .bind(original_file_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

async fn insert_events(
    conn: &mut SqliteConnection,
    file_id: i64,
    events: &[PremisEvent],
    agent_ids: &HashMap<&str, i64>,
) -> Result<()> {
    for event in events {
        let event_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO events (file_id, event_type, uuid, date, detail, outcome, outcome_detail)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(file_id)
        .bind(&event.event_type)
        .bind(&event.uuid)
        .bind(event.date)
        .bind(&event.detail)
        .bind(&event.outcome)
        .bind(&event.outcome_detail)
        .fetch_one(&mut *conn)
        .await?;

        for linking_type_value in &event.linking_agents {
            let Some(agent_id) = agent_ids.get(linking_type_value.as_str()) else {
                debug!(%linking_type_value, "Event links an agent the METS does not describe");
                continue;
            };
            sqlx::query("INSERT OR IGNORE INTO event_agents (event_id, agent_id) VALUES (?, ?)")
                .bind(event_id)
                .bind(*agent_id)
                .execute(&mut *conn)
                .await?;
        }
    }
    Ok(())
}
