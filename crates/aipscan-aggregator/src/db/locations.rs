use super::{Pipeline, StorageLocation, Store};
use crate::error::Result;

impl Store {
    /// Insert or refresh a storage location keyed by `current_location`.
    ///
    /// A `None` description keeps whatever was stored before.
    pub async fn upsert_storage_location(
        &self,
        current_location: &str,
        description: Option<&str>,
        storage_service_id: i64,
    ) -> Result<StorageLocation> {
        let location = sqlx::query_as::<_, StorageLocation>(
            r#"
            INSERT INTO storage_locations (current_location, description, storage_service_id)
            VALUES (?, ?, ?)
            ON CONFLICT (current_location) DO UPDATE SET
                description = COALESCE(excluded.description, storage_locations.description),
                storage_service_id = excluded.storage_service_id
            RETURNING id, current_location, description, storage_service_id
            "#,
        )
        .bind(current_location)
        .bind(description)
        .bind(storage_service_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(location)
    }

    pub async fn upsert_pipeline(
        &self,
        origin_pipeline: &str,
        dashboard_url: Option<&str>,
    ) -> Result<Pipeline> {
        let pipeline = sqlx::query_as::<_, Pipeline>(
            r#"
            INSERT INTO pipelines (origin_pipeline, dashboard_url)
            VALUES (?, ?)
            ON CONFLICT (origin_pipeline) DO UPDATE SET
                dashboard_url = COALESCE(excluded.dashboard_url, pipelines.dashboard_url)
            RETURNING id, origin_pipeline, dashboard_url
            "#,
        )
        .bind(origin_pipeline)
        .bind(dashboard_url)
        .fetch_one(&self.pool)
        .await?;
        Ok(pipeline)
    }

    pub async fn storage_locations(&self, storage_service_id: i64) -> Result<Vec<StorageLocation>> {
        let locations = sqlx::query_as::<_, StorageLocation>(
            "SELECT id, current_location, description, storage_service_id \
             FROM storage_locations WHERE storage_service_id = ? ORDER BY id",
        )
        .bind(storage_service_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(locations)
    }
}
