use super::{NewStorageService, StorageService, Store};
use crate::error::{AggregatorError, Result};

const SELECT_SERVICE: &str = "SELECT id, name, url, user_name, api_key, download_limit, \
     download_offset, is_default FROM storage_services";

impl Store {
    pub async fn create_storage_service(&self, new: &NewStorageService) -> Result<StorageService> {
        validate_page(new)?;
        let mut tx = self.pool.begin().await?;

        if new.is_default {
            sqlx::query("UPDATE storage_services SET is_default = 0 WHERE is_default = 1")
                .execute(&mut *tx)
                .await?;
        }

        let service = sqlx::query_as::<_, StorageService>(
            r#"
            INSERT INTO storage_services
                (name, url, user_name, api_key, download_limit, download_offset, is_default)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING id, name, url, user_name, api_key, download_limit, download_offset, is_default
            "#,
        )
        .bind(&new.name)
        .bind(&new.url)
        .bind(&new.user_name)
        .bind(&new.api_key)
        .bind(new.download_limit)
        .bind(new.download_offset)
        .bind(new.is_default)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(service)
    }

    /// Create the service named `new.name`, or update it in place.
    ///
    /// Returns the row and whether it was newly created.
    pub async fn upsert_storage_service(
        &self,
        new: &NewStorageService,
    ) -> Result<(StorageService, bool)> {
        validate_page(new)?;
        let mut tx = self.pool.begin().await?;

        if new.is_default {
            sqlx::query(
                "UPDATE storage_services SET is_default = 0 WHERE is_default = 1 AND name <> ?",
            )
            .bind(&new.name)
            .execute(&mut *tx)
            .await?;
        }

        let existing: Option<i64> =
            sqlx::query_scalar("SELECT id FROM storage_services WHERE name = ?")
                .bind(&new.name)
                .fetch_optional(&mut *tx)
                .await?;

        let service = sqlx::query_as::<_, StorageService>(
            r#"
            INSERT INTO storage_services
                (name, url, user_name, api_key, download_limit, download_offset, is_default)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (name) DO UPDATE SET
                url = excluded.url,
                user_name = excluded.user_name,
                api_key = excluded.api_key,
                download_limit = excluded.download_limit,
                download_offset = excluded.download_offset,
                is_default = excluded.is_default
            RETURNING id, name, url, user_name, api_key, download_limit, download_offset, is_default
            "#,
        )
        .bind(&new.name)
        .bind(&new.url)
        .bind(&new.user_name)
        .bind(&new.api_key)
        .bind(new.download_limit)
        .bind(new.download_offset)
        .bind(new.is_default)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((service, existing.is_none()))
    }

    pub async fn get_storage_service(&self, id: i64) -> Result<Option<StorageService>> {
        let service =
            sqlx::query_as::<_, StorageService>(&format!("{} WHERE id = ?", SELECT_SERVICE))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(service)
    }

    pub async fn default_storage_service(&self) -> Result<Option<StorageService>> {
        let service =
            sqlx::query_as::<_, StorageService>(&format!("{} WHERE is_default = 1", SELECT_SERVICE))
                .fetch_optional(&self.pool)
                .await?;
        Ok(service)
    }

    pub async fn list_storage_services(&self) -> Result<Vec<StorageService>> {
        let services =
            sqlx::query_as::<_, StorageService>(&format!("{} ORDER BY name", SELECT_SERVICE))
                .fetch_all(&self.pool)
                .await?;
        Ok(services)
    }

    /// Delete a service together with its fetch jobs, locations, agents and AIPs.
    pub async fn delete_storage_service(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM storage_services WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn validate_page(new: &NewStorageService) -> Result<()> {
    if new.download_limit < 1 {
        return Err(AggregatorError::config("download limit must be at least 1"));
    }
    if new.download_offset < 0 {
        return Err(AggregatorError::config("download offset cannot be negative"));
    }
    Ok(())
}
