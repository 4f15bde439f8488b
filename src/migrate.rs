//! Schema for the persisted sync state.
//!
//! All tables are keyed by collection name so one database can track
//! several vector-store collections. Statements are idempotent; running the
//! migrations on every startup is safe.

use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // One row per indexed document. Id lists are JSON arrays.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_documents (
            collection TEXT NOT NULL,
            path TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            mtime INTEGER NOT NULL,
            size INTEGER NOT NULL,
            format TEXT NOT NULL,
            chunk_ids TEXT NOT NULL DEFAULT '[]',
            pending_ids TEXT NOT NULL DEFAULT '[]',
            complete INTEGER NOT NULL DEFAULT 0,
            synced_at INTEGER NOT NULL,
            last_error TEXT,
            PRIMARY KEY (collection, path)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schedule_records (
            collection TEXT NOT NULL,
            job TEXT NOT NULL,
            last_success_at INTEGER,
            last_run_id TEXT,
            last_attempt_at INTEGER,
            last_error TEXT,
            PRIMARY KEY (collection, job)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_runs (
            id TEXT PRIMARY KEY,
            collection TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            finished_at INTEGER,
            status TEXT NOT NULL,
            documents_indexed INTEGER NOT NULL DEFAULT 0,
            documents_failed INTEGER NOT NULL DEFAULT 0,
            documents_removed INTEGER NOT NULL DEFAULT 0,
            chunks_upserted INTEGER NOT NULL DEFAULT 0,
            chunks_deleted INTEGER NOT NULL DEFAULT 0,
            chunks_failed INTEGER NOT NULL DEFAULT 0,
            error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // The embedding model each collection's vectors were produced with.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collections (
            collection TEXT PRIMARY KEY,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_sync_documents_complete ON sync_documents(collection, complete)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_sync_runs_started ON sync_runs(collection, started_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
