//! Durable tier: the shared, transactional source of truth.
//!
//! One SQLite file (or `sqlite::memory:` in tests) holds the `resources`
//! table and the `relations` edge table. Every process keeps its own fast
//! tier; they all converge on this store across restarts and instances.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use super::error::StoreError;
use super::key;
use super::resource::{Resource, now_millis};

#[derive(sqlx::FromRow)]
struct ResourceRow {
    key: String,
    url: String,
    mtime: i64,
    maxage: i64,
    valid: bool,
    code: i64,
    headers: String,
    data: Option<Vec<u8>>,
    builder: Option<String>,
}

impl ResourceRow {
    fn into_resource(self) -> Resource {
        let mut res = Resource::new(self.key);
        res.url = self.url;
        res.mtime = self.mtime;
        res.maxage = self.maxage;
        res.valid = self.valid;
        res.code = self.code.clamp(0, i64::from(u16::MAX)) as u16;
        res.headers = serde_json::from_str(&self.headers).unwrap_or_default();
        res.data = self.data.map(Into::into);
        res.builder = self.builder;
        res
    }
}

/// Handle over the shared durable store. Cheap to clone.
#[derive(Clone)]
pub struct DurableTier {
    pool: SqlitePool,
}

impl DurableTier {
    /// Open (creating if missing), run migrations, and return the tier.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|err| StoreError::validation(format!("bad durable url `{url}`: {err}")))?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|err| StoreError::transient(err.to_string()))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Load a resource with both edge directions attached.
    pub async fn get(&self, key: &str) -> Result<Option<Resource>, StoreError> {
        let row = sqlx::query_as::<_, ResourceRow>(
            "SELECT key, url, mtime, maxage, valid, code, headers, data, builder \
             FROM resources WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut res = row.into_resource();
        res.resources = self.children_of(key).await?;
        res.parents = self.parents_of(key).await?.into_iter().collect();
        Ok(Some(res))
    }

    /// Upsert the resource row and replace its declared edges, creating stub
    /// rows for children not yet cached so edges are never dangling.
    pub async fn put(&self, res: &Resource) -> Result<(), StoreError> {
        let headers = serde_json::to_string(&res.headers)
            .map_err(|err| StoreError::validation(format!("unencodable headers: {err}")))?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO resources (key, url, mtime, maxage, valid, code, headers, data, builder) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (key) DO UPDATE SET \
                 url = excluded.url, mtime = excluded.mtime, maxage = excluded.maxage, \
                 valid = excluded.valid, code = excluded.code, headers = excluded.headers, \
                 data = excluded.data, builder = excluded.builder",
        )
        .bind(&res.key)
        .bind(&res.url)
        .bind(res.mtime)
        .bind(res.maxage)
        .bind(res.valid)
        .bind(i64::from(res.code))
        .bind(&headers)
        .bind(res.data.as_ref().map(|d| d.to_vec()))
        .bind(&res.builder)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM relations WHERE parent_key = ?")
            .bind(&res.key)
            .execute(&mut *tx)
            .await?;

        for (ord, child) in res.resources.iter().enumerate() {
            sqlx::query(
                "INSERT INTO resources (key, url, valid) VALUES (?, ?, 0) \
                 ON CONFLICT (key) DO NOTHING",
            )
            .bind(child)
            .bind(key::parse(child).0)
            .execute(&mut *tx)
            .await?;
            sqlx::query("INSERT INTO relations (parent_key, child_key, ord) VALUES (?, ?, ?)")
                .bind(&res.key)
                .bind(child)
                .bind(ord as i64)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Declare a single edge without rewriting the parent's child set.
    pub async fn add_edge(&self, parent: &str, child: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for (k, url) in [(parent, key::parse(parent).0), (child, key::parse(child).0)] {
            sqlx::query(
                "INSERT INTO resources (key, url, valid) VALUES (?, ?, 0) \
                 ON CONFLICT (key) DO NOTHING",
            )
            .bind(k)
            .bind(url)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query(
            "INSERT INTO relations (parent_key, child_key, ord) \
             SELECT ?, ?, COALESCE(MAX(ord) + 1, 0) FROM relations WHERE parent_key = ? \
             ON CONFLICT (parent_key, child_key) DO NOTHING",
        )
        .bind(parent)
        .bind(child)
        .bind(parent)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Remove the row; edge rows in both directions go with it.
    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM resources WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Mark stale without touching data, edges or mtime.
    pub async fn invalidate(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE resources SET valid = 0 WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Apply an invalidation message: mark stale and advance mtime, but only
    /// when the message is newer than the stored row. Returns whether the row
    /// changed, which gates the cascade's re-publish.
    pub async fn invalidate_if_older(&self, key: &str, mtime: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE resources SET valid = 0, mtime = ? WHERE key = ? AND mtime < ?")
            .bind(mtime)
            .bind(key)
            .bind(mtime)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn parents_of(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT parent_key FROM relations WHERE child_key = ? ORDER BY parent_key",
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn children_of(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT child_key FROM relations WHERE parent_key = ? ORDER BY ord",
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Bulk-delete expired resources tagged with `builder`. Returns how many
    /// rows went away.
    pub async fn expire(&self, builder: &str) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM resources \
             WHERE builder = ? AND maxage > 0 AND mtime + maxage * 1000 < ?",
        )
        .bind(builder)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
