//! Postgres storage for contributed bib records and their clusters.
//!
//! Bib rows are keyed by `(local_identifier, source_id)` and upserted.
//! Cluster membership is refreshed on every ingest: a record joins the
//! first cluster of its configuration sharing one of its match-key values,
//! or mints a new one. The harvest side reads clusters through a paged,
//! transaction-scoped cursor.

use std::collections::VecDeque;

use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgExecutor, PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::matchkey;

/// Rows fetched per page while streaming a list response.
pub const FETCH_PAGE_SIZE: i64 = 100;

/// Wire body of `PUT /shared-index/records`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestEnvelope {
    pub source_id: Uuid,
    pub records: Vec<IngestRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRecord {
    pub local_id: String,
    pub marc_payload: Option<Value>,
    pub inventory_payload: Option<Value>,
}

/// A stored match-key configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchKeyConfig {
    pub id: String,
    pub method: String,
    pub params: Value,
}

/// One cluster row from the harvest cursor.
#[derive(Debug, Clone)]
pub struct ClusterRow {
    pub cluster_id: Uuid,
    pub datestamp: NaiveDateTime,
    pub match_key_config_id: String,
}

/// One member bib row of a cluster.
#[derive(Debug, Clone)]
pub struct ClusterMember {
    pub marc_payload: Option<Value>,
    pub inventory_payload: Option<Value>,
}

#[derive(Clone)]
pub struct Storage {
    pool: PgPool,
}

impl Storage {
    pub fn new(pool: PgPool) -> Self {
        Storage { pool }
    }

    /// Create tables if they do not exist.
    pub async fn init(&self) -> Result<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS bib_record \
             (id uuid NOT NULL PRIMARY KEY, \
              local_identifier VARCHAR NOT NULL, \
              source_id uuid NOT NULL, \
              marc_payload JSONB, \
              inventory_payload JSONB)",
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_local_id ON bib_record \
             (local_identifier, source_id)",
            "CREATE TABLE IF NOT EXISTS match_key_config \
             (id VARCHAR NOT NULL PRIMARY KEY, \
              method VARCHAR NOT NULL, \
              params JSONB NOT NULL)",
            "CREATE TABLE IF NOT EXISTS cluster_meta \
             (cluster_id uuid NOT NULL PRIMARY KEY, \
              match_key_config_id VARCHAR NOT NULL, \
              datestamp TIMESTAMP NOT NULL)",
            "CREATE INDEX IF NOT EXISTS cluster_meta_config_idx ON cluster_meta \
             (match_key_config_id, datestamp)",
            "CREATE TABLE IF NOT EXISTS cluster_record \
             (record_id uuid NOT NULL, \
              cluster_id uuid NOT NULL, \
              UNIQUE (record_id, cluster_id))",
            "CREATE TABLE IF NOT EXISTS cluster_value \
             (cluster_id uuid NOT NULL, \
              match_value VARCHAR NOT NULL, \
              UNIQUE (cluster_id, match_value))",
        ];
        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Drop all tables. Used by the tenant purge operation.
    pub async fn purge(&self) -> Result<()> {
        for table in [
            "cluster_value",
            "cluster_record",
            "cluster_meta",
            "match_key_config",
            "bib_record",
        ] {
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", table))
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Upsert an envelope of contributed records and refresh cluster
    /// membership for every stored match-key configuration.
    pub async fn upsert_ingest_records(&self, envelope: &IngestEnvelope) -> Result<()> {
        let configs = self.match_key_configs().await?;
        let mut methods = Vec::with_capacity(configs.len());
        for config in &configs {
            methods.push(matchkey::method_for(&config.method, &config.params)?);
        }
        for record in &envelope.records {
            let record_id: Uuid = sqlx::query(
                "INSERT INTO bib_record \
                 (id, local_identifier, source_id, marc_payload, inventory_payload) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (local_identifier, source_id) DO UPDATE \
                 SET marc_payload = $4, inventory_payload = $5 \
                 RETURNING id",
            )
            .bind(Uuid::new_v4())
            .bind(&record.local_id)
            .bind(envelope.source_id)
            .bind(&record.marc_payload)
            .bind(&record.inventory_payload)
            .fetch_one(&self.pool)
            .await?
            .try_get("id")?;

            let empty = Value::Object(Default::default());
            let marc = record.marc_payload.as_ref().unwrap_or(&empty);
            let inventory = record.inventory_payload.as_ref().unwrap_or(&empty);
            for (config, method) in configs.iter().zip(&methods) {
                let keys = method.extract_keys(marc, inventory)?;
                self.update_cluster(record_id, &config.id, &keys).await?;
            }
        }
        Ok(())
    }

    /// Attach a record to the cluster of its configuration sharing one of
    /// its match-key values; mint a new cluster when none does (also for
    /// records without keys, so deletions stay harvestable as tombstones).
    async fn update_cluster(
        &self,
        record_id: Uuid,
        config_id: &str,
        keys: &[String],
    ) -> Result<()> {
        sqlx::query(
            "DELETE FROM cluster_record WHERE record_id = $1 AND cluster_id IN \
             (SELECT cluster_id FROM cluster_meta WHERE match_key_config_id = $2)",
        )
        .bind(record_id)
        .bind(config_id)
        .execute(&self.pool)
        .await?;

        let existing: Option<Uuid> = if keys.is_empty() {
            None
        } else {
            sqlx::query(
                "SELECT cv.cluster_id FROM cluster_value cv \
                 JOIN cluster_meta cm ON cm.cluster_id = cv.cluster_id \
                 WHERE cm.match_key_config_id = $1 AND cv.match_value = ANY($2) \
                 ORDER BY cv.cluster_id LIMIT 1",
            )
            .bind(config_id)
            .bind(keys)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| row.try_get("cluster_id"))
            .transpose()?
        };

        let cluster_id = match existing {
            Some(id) => {
                sqlx::query("UPDATE cluster_meta SET datestamp = $2 WHERE cluster_id = $1")
                    .bind(id)
                    .bind(Utc::now().naive_utc())
                    .execute(&self.pool)
                    .await?;
                id
            }
            None => {
                let id = Uuid::new_v4();
                sqlx::query(
                    "INSERT INTO cluster_meta (cluster_id, match_key_config_id, datestamp) \
                     VALUES ($1, $2, $3)",
                )
                .bind(id)
                .bind(config_id)
                .bind(Utc::now().naive_utc())
                .execute(&self.pool)
                .await?;
                id
            }
        };

        sqlx::query(
            "INSERT INTO cluster_record (record_id, cluster_id) VALUES ($1, $2) \
             ON CONFLICT DO NOTHING",
        )
        .bind(record_id)
        .bind(cluster_id)
        .execute(&self.pool)
        .await?;
        for key in keys {
            sqlx::query(
                "INSERT INTO cluster_value (cluster_id, match_value) VALUES ($1, $2) \
                 ON CONFLICT DO NOTHING",
            )
            .bind(cluster_id)
            .bind(key)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn insert_match_key_config(&self, config: &MatchKeyConfig) -> Result<()> {
        // Resolve the method now so a bad configuration is rejected here,
        // not on first ingest.
        matchkey::method_for(&config.method, &config.params)?;
        sqlx::query("INSERT INTO match_key_config (id, method, params) VALUES ($1, $2, $3)")
            .bind(&config.id)
            .bind(&config.method)
            .bind(&config.params)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Not-found is `Ok(None)`, distinct from lookup failure.
    pub async fn select_match_key_config(&self, id: &str) -> Result<Option<MatchKeyConfig>> {
        let row = sqlx::query("SELECT id, method, params FROM match_key_config WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| config_from_row(&row)).transpose()
    }

    /// `Ok(true)` if deleted, `Ok(false)` if it did not exist.
    pub async fn delete_match_key_config(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM match_key_config WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn match_key_configs(&self) -> Result<Vec<MatchKeyConfig>> {
        let rows = sqlx::query("SELECT id, method, params FROM match_key_config ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(config_from_row).collect()
    }

    /// Single cluster lookup used by `GetRecord`.
    pub async fn cluster_meta(&self, cluster_id: Uuid) -> Result<Option<ClusterRow>> {
        let row = sqlx::query(
            "SELECT cluster_id, datestamp, match_key_config_id FROM cluster_meta \
             WHERE cluster_id = $1",
        )
        .bind(cluster_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| cluster_from_row(&row)).transpose()
    }

    pub async fn cluster_members(&self, cluster_id: Uuid) -> Result<Vec<ClusterMember>> {
        fetch_members(&self.pool, cluster_id).await
    }

    pub async fn cluster_values(&self, cluster_id: Uuid) -> Result<Vec<String>> {
        fetch_values(&self.pool, cluster_id).await
    }

    /// Open a transaction-scoped, paged cursor over cluster rows of one
    /// configuration. `from` is inclusive; `until` is inclusive too (the
    /// observed server-side query construction uses `<=`).
    ///
    /// All pages read one snapshot. A concurrent ingest touches
    /// `cluster_meta.datestamp`, which reorders rows between OFFSET windows;
    /// under the default READ COMMITTED isolation that re-delivers already
    /// harvested clusters and silently skips undelivered ones.
    pub async fn cluster_stream(
        &self,
        config_id: &str,
        from: Option<NaiveDateTime>,
        until: Option<NaiveDateTime>,
    ) -> Result<ClusterStream> {
        let tx = begin_snapshot(&self.pool).await?;
        Ok(ClusterStream {
            tx,
            config_id: config_id.to_string(),
            from,
            until,
            offset: 0,
            page: VecDeque::new(),
            done: false,
        })
    }

    /// Open a transaction-scoped, paged cursor over stored bib rows.
    pub async fn bib_record_stream(
        &self,
        source_id: Option<Uuid>,
        local_id: Option<String>,
    ) -> Result<BibStream> {
        let tx = begin_snapshot(&self.pool).await?;
        Ok(BibStream {
            tx,
            source_id,
            local_id,
            offset: 0,
            page: VecDeque::new(),
            done: false,
        })
    }
}

/// One stored bib row as listed over HTTP.
#[derive(Debug, Clone)]
pub struct BibRecordRow {
    pub id: Uuid,
    pub local_identifier: String,
    pub source_id: Uuid,
    pub marc_payload: Option<Value>,
    pub inventory_payload: Option<Value>,
}

/// Paged cursor over cluster rows, holding one connection and one
/// transaction for the lifetime of a list response. Pages are fetched lazily
/// so the next page is only read once the caller asks for it.
pub struct ClusterStream {
    tx: Transaction<'static, Postgres>,
    config_id: String,
    from: Option<NaiveDateTime>,
    until: Option<NaiveDateTime>,
    offset: i64,
    page: VecDeque<ClusterRow>,
    done: bool,
}

impl ClusterStream {
    pub async fn next_row(&mut self) -> Result<Option<ClusterRow>> {
        if self.page.is_empty() && !self.done {
            self.fetch_page().await?;
        }
        Ok(self.page.pop_front())
    }

    async fn fetch_page(&mut self) -> Result<()> {
        let mut sql = String::from(
            "SELECT cluster_id, datestamp, match_key_config_id FROM cluster_meta \
             WHERE match_key_config_id = $1",
        );
        let mut n = 2;
        if self.from.is_some() {
            sql.push_str(&format!(" AND datestamp >= ${}", n));
            n += 1;
        }
        if self.until.is_some() {
            sql.push_str(&format!(" AND datestamp <= ${}", n));
            n += 1;
        }
        sql.push_str(&format!(
            " ORDER BY datestamp, cluster_id LIMIT {} OFFSET ${}",
            FETCH_PAGE_SIZE, n
        ));

        let mut query = sqlx::query(&sql).bind(&self.config_id);
        if let Some(from) = self.from {
            query = query.bind(from);
        }
        if let Some(until) = self.until {
            query = query.bind(until);
        }
        let rows = query.bind(self.offset).fetch_all(&mut *self.tx).await?;
        self.offset += rows.len() as i64;
        if (rows.len() as i64) < FETCH_PAGE_SIZE {
            self.done = true;
        }
        for row in &rows {
            self.page.push_back(cluster_from_row(row)?);
        }
        Ok(())
    }

    /// Member rows in insertion order (`ORDER BY id`), making the
    /// first-non-null representative payload deterministic.
    pub async fn cluster_members(&mut self, cluster_id: Uuid) -> Result<Vec<ClusterMember>> {
        fetch_members(&mut *self.tx, cluster_id).await
    }

    pub async fn cluster_values(&mut self, cluster_id: Uuid) -> Result<Vec<String>> {
        fetch_values(&mut *self.tx, cluster_id).await
    }

    /// Commit to release server-side cursor resources. Only reads were
    /// issued, but the commit is still explicit.
    pub async fn finish(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

/// Paged cursor over stored bib rows, optionally filtered by source and
/// local identifier. Same one-snapshot transaction discipline as
/// [`ClusterStream`].
pub struct BibStream {
    tx: Transaction<'static, Postgres>,
    source_id: Option<Uuid>,
    local_id: Option<String>,
    offset: i64,
    page: VecDeque<BibRecordRow>,
    done: bool,
}

impl BibStream {
    pub async fn next_row(&mut self) -> Result<Option<BibRecordRow>> {
        if self.page.is_empty() && !self.done {
            self.fetch_page().await?;
        }
        Ok(self.page.pop_front())
    }

    async fn fetch_page(&mut self) -> Result<()> {
        let mut sql = String::from(
            "SELECT id, local_identifier, source_id, marc_payload, inventory_payload \
             FROM bib_record WHERE TRUE",
        );
        let mut n = 1;
        if self.source_id.is_some() {
            sql.push_str(&format!(" AND source_id = ${}", n));
            n += 1;
        }
        if self.local_id.is_some() {
            sql.push_str(&format!(" AND local_identifier = ${}", n));
            n += 1;
        }
        sql.push_str(&format!(
            " ORDER BY id LIMIT {} OFFSET ${}",
            FETCH_PAGE_SIZE, n
        ));

        let mut query = sqlx::query(&sql);
        if let Some(source_id) = self.source_id {
            query = query.bind(source_id);
        }
        if let Some(local_id) = &self.local_id {
            query = query.bind(local_id);
        }
        let rows = query.bind(self.offset).fetch_all(&mut *self.tx).await?;
        self.offset += rows.len() as i64;
        if (rows.len() as i64) < FETCH_PAGE_SIZE {
            self.done = true;
        }
        for row in &rows {
            self.page.push_back(BibRecordRow {
                id: row.try_get("id")?,
                local_identifier: row.try_get("local_identifier")?,
                source_id: row.try_get("source_id")?,
                marc_payload: row.try_get("marc_payload")?,
                inventory_payload: row.try_get("inventory_payload")?,
            });
        }
        Ok(())
    }

    pub async fn finish(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

/// Begin a read transaction whose first query pins a single snapshot for
/// every later page fetch.
async fn begin_snapshot(pool: &PgPool) -> Result<Transaction<'static, Postgres>> {
    let mut tx = pool.begin().await?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
        .execute(&mut *tx)
        .await?;
    Ok(tx)
}

async fn fetch_members<'e, E: PgExecutor<'e>>(
    executor: E,
    cluster_id: Uuid,
) -> Result<Vec<ClusterMember>> {
    let rows = sqlx::query(
        "SELECT b.marc_payload, b.inventory_payload FROM bib_record b \
         JOIN cluster_record cr ON cr.record_id = b.id \
         WHERE cr.cluster_id = $1 ORDER BY b.id",
    )
    .bind(cluster_id)
    .fetch_all(executor)
    .await?;
    rows.iter()
        .map(|row| {
            Ok(ClusterMember {
                marc_payload: row.try_get("marc_payload")?,
                inventory_payload: row.try_get("inventory_payload")?,
            })
        })
        .collect()
}

async fn fetch_values<'e, E: PgExecutor<'e>>(executor: E, cluster_id: Uuid) -> Result<Vec<String>> {
    let rows = sqlx::query(
        "SELECT match_value FROM cluster_value WHERE cluster_id = $1 ORDER BY match_value",
    )
    .bind(cluster_id)
    .fetch_all(executor)
    .await?;
    rows.iter()
        .map(|row| row.try_get("match_value").map_err(Error::from))
        .collect()
}

fn config_from_row(row: &PgRow) -> Result<MatchKeyConfig> {
    Ok(MatchKeyConfig {
        id: row.try_get("id")?,
        method: row.try_get("method")?,
        params: row.try_get("params")?,
    })
}

fn cluster_from_row(row: &PgRow) -> Result<ClusterRow> {
    Ok(ClusterRow {
        cluster_id: row.try_get("cluster_id")?,
        datestamp: row.try_get("datestamp")?,
        match_key_config_id: row.try_get("match_key_config_id")?,
    })
}
