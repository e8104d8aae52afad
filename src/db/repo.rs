use super::model::{BlobRow, BlobTable, QueuedPipeRow};
use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::instrument;

pub type Pool = SqlitePool;
pub type Tx<'a> = Transaction<'a, Sqlite>;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// Single-connection in-memory pool with migrations applied. Every
/// connection to `sqlite::memory:` opens its own database, so the pool is
/// capped at one.
pub async fn memory_pool() -> Result<Pool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// For file-backed SQLite URLs, expand a leading `~/` and create the parent
/// directory. In-memory and non-sqlite URLs pass through.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }

    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let path = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query {
        Some(q) => format!("sqlite://{}?{}", path, q),
        None => format!("sqlite://{}", path),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[instrument(skip_all, fields(table = table.as_str()))]
pub async fn upsert_blob(
    pool: &Pool,
    table: BlobTable,
    workspace_id: i64,
    key: &str,
    data: &str,
) -> Result<(), sqlx::Error> {
    let sql = format!(
        "INSERT INTO {} (workspace_id, key, data) VALUES (?, ?, ?) \
         ON CONFLICT (workspace_id, key) DO UPDATE SET data = excluded.data",
        table.as_str()
    );
    sqlx::query(&sql)
        .bind(workspace_id)
        .bind(key)
        .bind(data)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all, fields(table = table.as_str()))]
pub async fn select_blob(
    pool: &Pool,
    table: BlobTable,
    workspace_id: i64,
    key: &str,
) -> Result<Option<String>, sqlx::Error> {
    let sql = format!(
        "SELECT data FROM {} WHERE workspace_id = ? AND key = ?",
        table.as_str()
    );
    sqlx::query_scalar::<_, String>(&sql)
        .bind(workspace_id)
        .bind(key)
        .fetch_optional(pool)
        .await
}

/// All rows of a workspace, ordered by key.
#[instrument(skip_all, fields(table = table.as_str()))]
pub async fn select_blobs(
    pool: &Pool,
    table: BlobTable,
    workspace_id: i64,
) -> Result<Vec<BlobRow>, sqlx::Error> {
    let sql = format!(
        "SELECT workspace_id, key, data FROM {} WHERE workspace_id = ? ORDER BY key",
        table.as_str()
    );
    let rows = sqlx::query(&sql).bind(workspace_id).fetch_all(pool).await?;
    Ok(rows.into_iter().map(blob_row).collect())
}

/// Every row of a table across workspaces.
#[instrument(skip_all, fields(table = table.as_str()))]
pub async fn select_all_blobs(pool: &Pool, table: BlobTable) -> Result<Vec<BlobRow>, sqlx::Error> {
    let sql = format!(
        "SELECT workspace_id, key, data FROM {} ORDER BY workspace_id, key",
        table.as_str()
    );
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    Ok(rows.into_iter().map(blob_row).collect())
}

fn blob_row(row: sqlx::sqlite::SqliteRow) -> BlobRow {
    BlobRow {
        workspace_id: row.get("workspace_id"),
        key: row.get("key"),
        data: row.get("data"),
    }
}

pub async fn delete_blob_tx(
    tx: &mut Tx<'_>,
    table: BlobTable,
    workspace_id: i64,
    key: &str,
) -> Result<u64, sqlx::Error> {
    let sql = format!(
        "DELETE FROM {} WHERE workspace_id = ? AND key = ?",
        table.as_str()
    );
    let res = sqlx::query(&sql)
        .bind(workspace_id)
        .bind(key)
        .execute(&mut **tx)
        .await?;
    Ok(res.rows_affected())
}

/// Deletes rows whose key starts with `prefix`.
pub async fn delete_blobs_with_prefix_tx(
    tx: &mut Tx<'_>,
    table: BlobTable,
    workspace_id: i64,
    prefix: &str,
) -> Result<u64, sqlx::Error> {
    let sql = format!(
        "DELETE FROM {} WHERE workspace_id = ? AND substr(key, 1, ?) = ?",
        table.as_str()
    );
    let res = sqlx::query(&sql)
        .bind(workspace_id)
        .bind(prefix.len() as i64)
        .bind(prefix)
        .execute(&mut **tx)
        .await?;
    Ok(res.rows_affected())
}

#[instrument(skip_all)]
pub async fn insert_import(
    pool: &Pool,
    workspace_id: i64,
    key: &str,
    data: &str,
    created_at: DateTime<Utc>,
) -> Result<i64, sqlx::Error> {
    // Stepped to completion so other pool connections see the row.
    let res = sqlx::query(
        "INSERT INTO imports (workspace_id, key, data, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(workspace_id)
    .bind(key)
    .bind(data)
    .bind(created_at)
    .execute(pool)
    .await?;
    Ok(res.last_insert_rowid())
}

#[instrument(skip_all)]
pub async fn latest_import(
    pool: &Pool,
    workspace_id: i64,
    key: &str,
) -> Result<Option<(String, DateTime<Utc>)>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT data, created_at FROM imports WHERE workspace_id = ? AND key = ? \
         ORDER BY created_at DESC, id DESC LIMIT 1",
    )
    .bind(workspace_id)
    .bind(key)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| (r.get("data"), r.get("created_at"))))
}

pub async fn delete_imports_with_prefix_tx(
    tx: &mut Tx<'_>,
    workspace_id: i64,
    prefix: &str,
) -> Result<u64, sqlx::Error> {
    let res = sqlx::query(
        "DELETE FROM imports WHERE workspace_id = ? AND substr(key, 1, ?) = ?",
    )
    .bind(workspace_id)
    .bind(prefix.len() as i64)
    .bind(prefix)
    .execute(&mut **tx)
    .await?;
    Ok(res.rows_affected())
}

/// Plain insert of a pending job. A second pending row for the same pipe
/// violates the partial unique index.
#[instrument(skip_all)]
pub async fn enqueue_pipe(
    pool: &Pool,
    workspace_id: i64,
    key: &str,
    priority: i64,
) -> Result<i64, sqlx::Error> {
    let res = sqlx::query(
        "INSERT INTO queued_pipes (workspace_id, key, priority, created_at) \
         VALUES (?, ?, ?, CURRENT_TIMESTAMP)",
    )
    .bind(workspace_id)
    .bind(key)
    .bind(priority)
    .execute(pool)
    .await?;
    Ok(res.last_insert_rowid())
}

/// Inserts a pending job or raises the priority of the one already pending.
#[instrument(skip_all)]
pub async fn enqueue_pipe_at_least(
    pool: &Pool,
    workspace_id: i64,
    key: &str,
    priority: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO queued_pipes (workspace_id, key, priority, created_at) \
         VALUES (?, ?, ?, CURRENT_TIMESTAMP) \
         ON CONFLICT (workspace_id, key) WHERE locked_at IS NULL \
         DO UPDATE SET priority = max(queued_pipes.priority, excluded.priority)",
    )
    .bind(workspace_id)
    .bind(key)
    .bind(priority)
    .execute(pool)
    .await?;
    Ok(())
}

/// Inserts a job already locked, unless the workspace has a job in flight.
/// Returns the new row id when the job was taken.
#[instrument(skip_all)]
pub async fn claim_pipe(
    pool: &Pool,
    workspace_id: i64,
    key: &str,
    priority: i64,
) -> Result<Option<i64>, sqlx::Error> {
    let res = sqlx::query(
        "INSERT INTO queued_pipes (workspace_id, key, priority, created_at, locked_at) \
         SELECT ?, ?, ?, CURRENT_TIMESTAMP, CURRENT_TIMESTAMP \
         WHERE NOT EXISTS (SELECT 1 FROM queued_pipes \
                           WHERE workspace_id = ? AND locked_at IS NOT NULL)",
    )
    .bind(workspace_id)
    .bind(key)
    .bind(priority)
    .bind(workspace_id)
    .execute(pool)
    .await?;
    if res.rows_affected() == 0 {
        return Ok(None);
    }
    Ok(Some(res.last_insert_rowid()))
}

/// Locks and returns up to `limit` jobs: the best pending job of every
/// workspace that has nothing in flight, highest priority first.
#[instrument(skip_all)]
pub async fn dequeue_pipes(pool: &Pool, limit: u32) -> Result<Vec<QueuedPipeRow>, sqlx::Error> {
    let rows = sqlx::query(
        "UPDATE queued_pipes SET locked_at = CURRENT_TIMESTAMP WHERE id IN ( \
            SELECT q.id FROM queued_pipes q \
            WHERE q.locked_at IS NULL \
              AND NOT EXISTS (SELECT 1 FROM queued_pipes l \
                              WHERE l.workspace_id = q.workspace_id AND l.locked_at IS NOT NULL) \
              AND q.id = (SELECT p.id FROM queued_pipes p \
                          WHERE p.workspace_id = q.workspace_id AND p.locked_at IS NULL \
                          ORDER BY p.priority DESC, p.id ASC LIMIT 1) \
            ORDER BY q.priority DESC, q.id ASC \
            LIMIT ?) \
         RETURNING id, workspace_id, key, priority",
    )
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    let mut jobs: Vec<QueuedPipeRow> = rows
        .into_iter()
        .map(|row| QueuedPipeRow {
            id: row.get("id"),
            workspace_id: row.get("workspace_id"),
            key: row.get("key"),
            priority: row.get("priority"),
        })
        .collect();
    // RETURNING order is unspecified.
    jobs.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
    Ok(jobs)
}

#[instrument(skip_all)]
pub async fn delete_queued_pipe(pool: &Pool, id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM queued_pipes WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn delete_queued_with_prefix_tx(
    tx: &mut Tx<'_>,
    workspace_id: i64,
    prefix: &str,
) -> Result<u64, sqlx::Error> {
    let res = sqlx::query(
        "DELETE FROM queued_pipes WHERE workspace_id = ? AND substr(key, 1, ?) = ?",
    )
    .bind(workspace_id)
    .bind(prefix.len() as i64)
    .bind(prefix)
    .execute(&mut **tx)
    .await?;
    Ok(res.rows_affected())
}

/// Returns jobs left locked by a previous process to the pending state.
/// Locked rows that already have a pending twin are dropped instead.
#[instrument(skip_all)]
pub async fn release_locked_pipes(pool: &Pool) -> Result<u64, sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "DELETE FROM queued_pipes WHERE locked_at IS NOT NULL AND EXISTS ( \
            SELECT 1 FROM queued_pipes p WHERE p.workspace_id = queued_pipes.workspace_id \
              AND p.key = queued_pipes.key AND p.locked_at IS NULL)",
    )
    .execute(&mut *tx)
    .await?;
    let res = sqlx::query("UPDATE queued_pipes SET locked_at = NULL WHERE locked_at IS NOT NULL")
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(res.rows_affected())
}

#[instrument(skip_all)]
pub async fn count_queued_pipes(pool: &Pool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM queued_pipes")
        .fetch_one(pool)
        .await
}
