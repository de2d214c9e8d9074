// =============================================================================
// SQLite candle store
// =============================================================================
//
// One connection behind a mutex, driven from `spawn_blocking` so SQLite I/O
// never stalls the async workers. WAL mode lets readers (dashboards,
// backtests) attach to the file while the collector writes.
//
// Upsert on the primary key `(symbol, interval, t)` makes re-flushing a candle
// after a failed batch idempotent.
// =============================================================================

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::{debug, info};

use super::CandleStore;
use crate::types::CandleRow;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const UPSERT_SQL: &str = r#"
    INSERT INTO candles (symbol, interval, t, o, h, l, c, v, updated_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
    ON CONFLICT(symbol, interval, t) DO UPDATE SET
        o = excluded.o,
        h = excluded.h,
        l = excluded.l,
        c = excluded.c,
        v = excluded.v,
        updated_at = excluded.updated_at
"#;

pub struct SqliteCandleStore {
    conn: Arc<Mutex<Connection>>,
    /// Interval label stored alongside each row (e.g. `5000ms`).
    interval: String,
}

impl SqliteCandleStore {
    /// Open (or create) the database at `path`. `":memory:"` gives a private
    /// in-memory database.
    pub fn open(path: impl AsRef<Path>, interval: impl Into<String>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open candle db {}", path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("failed to set busy timeout")?;
        ensure_db(&conn)?;

        info!(path = %path.display(), "candle db ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            interval: interval.into(),
        })
    }
}

#[async_trait]
impl CandleStore for SqliteCandleStore {
    async fn insert_candles(&self, rows: &[CandleRow], symbol: &str) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        let conn = self.conn.clone();
        let rows = rows.to_vec();
        let sym = symbol.to_string();
        let interval = self.interval.clone();

        let written = tokio::task::spawn_blocking(move || -> Result<usize> {
            let mut conn = conn.lock();
            let updated_at =
                chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

            let tx = conn.transaction().context("failed to begin transaction")?;
            let mut written = 0;
            {
                let mut stmt = tx.prepare_cached(UPSERT_SQL)?;
                for (t, o, h, l, c, v) in &rows {
                    written += stmt.execute(params![sym, interval, t, o, h, l, c, v, updated_at])?;
                }
            }
            tx.commit().context("failed to commit candle batch")?;
            Ok(written)
        })
        .await
        .context("candle write task failed")??;

        debug!(symbol = %symbol, written, "candle batch upserted");
        Ok(written)
    }

    async fn recent_candles(&self, symbol: &str, limit: usize) -> Result<Vec<CandleRow>> {
        let conn = self.conn.clone();
        let symbol = symbol.to_string();
        let interval = self.interval.clone();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        tokio::task::spawn_blocking(move || -> Result<Vec<CandleRow>> {
            let conn = conn.lock();
            let mut stmt = conn.prepare_cached(
                "SELECT t, o, h, l, c, v
                 FROM candles
                 WHERE symbol = ?1 AND interval = ?2
                 ORDER BY t DESC
                 LIMIT ?3",
            )?;
            let mut rows = stmt
                .query_map(params![symbol, interval, limit], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                })?
                .collect::<Result<Vec<CandleRow>, _>>()?;
            // The query is newest-first. Reverse to chronological.
            rows.reverse();
            Ok(rows)
        })
        .await
        .context("candle read task failed")?
    }
}

fn ensure_db(conn: &Connection) -> Result<()> {
    // Pragmas (best-effort).
    let _ = conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;");

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS candles (
            symbol TEXT NOT NULL,
            interval TEXT NOT NULL,
            t INTEGER NOT NULL,
            o REAL NOT NULL,
            h REAL NOT NULL,
            l REAL NOT NULL,
            c REAL NOT NULL,
            v REAL NOT NULL,
            updated_at TEXT,
            PRIMARY KEY (symbol, interval, t)
        );
        "#,
    )
    .context("failed to create candles table")?;
    Ok(())
}
