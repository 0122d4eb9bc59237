use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use tracing::warn;

use crate::settings::SettingsStore;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// Immutable setup record of one plant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlantConfig {
    pub plant_id: String,
    pub name: String,
    pub moisture_entity: String,
    pub pump_switch: String,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/plant-hub/plant-hub.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // Every connection to an in-memory database is a separate database.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Plant setup records
    // ----------------------------

    pub async fn upsert_plant(&self, p: &PlantConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO plants (plant_id, name, moisture_entity, pump_switch)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(plant_id) DO UPDATE SET
              name=excluded.name,
              moisture_entity=excluded.moisture_entity,
              pump_switch=excluded.pump_switch
            "#,
        )
        .bind(&p.plant_id)
        .bind(&p.name)
        .bind(&p.moisture_entity)
        .bind(&p.pump_switch)
        .execute(&self.pool)
        .await
        .with_context(|| format!("upsert_plant {} failed", p.plant_id))?;
        Ok(())
    }

    pub async fn load_plants(&self) -> Result<Vec<PlantConfig>> {
        let rows = sqlx::query(
            r#"
            SELECT plant_id, name, moisture_entity, pump_switch
            FROM plants
            ORDER BY plant_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load_plants failed")?;

        rows.iter().map(plant_from_row).collect()
    }

    /// Delete plants not in `keep`. Their settings go with them.
    pub async fn prune_plants(&self, keep: &[String]) -> Result<u64> {
        let existing = self.load_plants().await?;
        let mut removed = 0;
        for p in existing.iter().filter(|p| !keep.contains(&p.plant_id)) {
            removed += sqlx::query("DELETE FROM plants WHERE plant_id = ?")
                .bind(&p.plant_id)
                .execute(&self.pool)
                .await
                .context("prune_plants failed")?
                .rows_affected();
        }
        Ok(removed)
    }

    // ----------------------------
    // Settings overlay
    // ----------------------------

    pub async fn load_settings(&self, plant_id: &str) -> Result<Map<String, Value>> {
        let rows = sqlx::query(
            r#"
            SELECT key, value
            FROM plant_settings
            WHERE plant_id = ?
            ORDER BY key
            "#,
        )
        .bind(plant_id)
        .fetch_all(&self.pool)
        .await
        .context("load_settings failed")?;

        let mut out = Map::new();
        for row in rows {
            let key: String = row.try_get("key")?;
            let raw: String = row.try_get("value")?;
            match serde_json::from_str(&raw) {
                Ok(v) => {
                    out.insert(key, v);
                }
                Err(e) => warn!(plant = %plant_id, key = %key, "db: dropping unreadable setting: {e}"),
            }
        }
        Ok(out)
    }

    pub async fn merge_settings(&self, plant_id: &str, patch: &Map<String, Value>) -> Result<()> {
        let mut tx = self.pool.begin().await.context("merge_settings: begin failed")?;
        for (key, value) in patch {
            sqlx::query(
                r#"
                INSERT INTO plant_settings (plant_id, key, value)
                VALUES (?, ?, ?)
                ON CONFLICT(plant_id, key) DO UPDATE SET value=excluded.value
                "#,
            )
            .bind(plant_id)
            .bind(key)
            .bind(value.to_string())
            .execute(&mut *tx)
            .await
            .with_context(|| format!("merge_settings {plant_id}.{key} failed"))?;
        }
        tx.commit().await.context("merge_settings: commit failed")?;
        Ok(())
    }

    pub async fn remove_setting(&self, plant_id: &str, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM plant_settings WHERE plant_id = ? AND key = ?")
            .bind(plant_id)
            .bind(key)
            .execute(&self.pool)
            .await
            .context("remove_setting failed")?;
        Ok(())
    }

    pub async fn clear_settings(&self, plant_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM plant_settings WHERE plant_id = ?")
            .bind(plant_id)
            .execute(&self.pool)
            .await
            .context("clear_settings failed")?;
        Ok(())
    }
}

fn plant_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<PlantConfig> {
    Ok(PlantConfig {
        plant_id: row.try_get("plant_id")?,
        name: row.try_get("name")?,
        moisture_entity: row.try_get("moisture_entity")?,
        pump_switch: row.try_get("pump_switch")?,
    })
}

#[async_trait]
impl SettingsStore for Db {
    async fn load(&self, plant_id: &str) -> Result<Map<String, Value>> {
        self.load_settings(plant_id).await
    }

    async fn merge(&self, plant_id: &str, patch: &Map<String, Value>) -> Result<()> {
        self.merge_settings(plant_id, patch).await
    }

    async fn remove(&self, plant_id: &str, key: &str) -> Result<()> {
        self.remove_setting(plant_id, key).await
    }

    async fn clear(&self, plant_id: &str) -> Result<()> {
        self.clear_settings(plant_id).await
    }
}
