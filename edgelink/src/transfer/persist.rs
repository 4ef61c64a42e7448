//! Persistence of unfinished transfers.
//!
//! The engine itself is memory-only; the agent snapshots its unfinished work
//! into a small sqlite database in the runtime directory so that downloads
//! and uploads survive a restart and resume without operator intervention.

use std::path::Path;
use std::sync::Arc;

use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Connection, Row, SqliteConnection};
use tokio::sync::Mutex;

use crate::status::{AgentError, ErrorKind, Result};

use super::{Checksum, ChecksumAlgorithm, TransferDirection, TransferRequest};

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS Transfers (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    direction     TEXT NOT NULL,
    local_path    TEXT NOT NULL,
    url           TEXT NOT NULL,
    response_url  TEXT,
    token         TEXT,
    checksum      TEXT,
    algorithm     TEXT,
    expected_size INTEGER,
    global        INTEGER NOT NULL DEFAULT 0
);";

/// Store of unfinished transfers, backed by one sqlite file.
#[derive(Clone)]
pub struct TransferStore {
    conn: Arc<Mutex<SqliteConnection>>,
}

impl TransferStore {
    pub async fn open(path: &Path) -> Result<TransferStore> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let mut conn = SqliteConnection::connect_with(&options)
            .await
            .map_err(sqlite_error)?;
        sqlx::query(SCHEMA)
            .execute(&mut conn)
            .await
            .map_err(sqlite_error)?;
        Ok(TransferStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Replaces the stored set with the given snapshot.
    pub async fn save(&self, requests: &[TransferRequest]) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let mut tx = conn.begin().await.map_err(sqlite_error)?;
        sqlx::query("DELETE FROM Transfers")
            .execute(&mut *tx)
            .await
            .map_err(sqlite_error)?;
        for request in requests {
            sqlx::query(
                "INSERT INTO Transfers \
                 (direction, local_path, url, response_url, token, checksum, algorithm, expected_size, global) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(request.direction.as_str())
            .bind(request.local_path.to_string_lossy().into_owned())
            .bind(&request.url)
            .bind(&request.response_url)
            .bind(&request.token)
            .bind(request.checksum.as_ref().map(|c| c.hex.clone()))
            .bind(request.checksum.as_ref().map(|c| c.algorithm.as_str()))
            .bind(request.expected_size.map(|size| size as i64))
            .bind(request.global)
            .execute(&mut *tx)
            .await
            .map_err(sqlite_error)?;
        }
        tx.commit().await.map_err(sqlite_error)?;
        Ok(())
    }

    /// Loads every stored transfer, oldest first.
    pub async fn load(&self) -> Result<Vec<TransferRequest>> {
        let mut conn = self.conn.lock().await;
        let rows = sqlx::query(
            "SELECT direction, local_path, url, response_url, token, checksum, algorithm, expected_size, global \
             FROM Transfers ORDER BY id",
        )
        .fetch_all(&mut *conn)
        .await
        .map_err(sqlite_error)?;

        let mut requests = Vec::with_capacity(rows.len());
        for row in rows {
            let direction: String = row.get("direction");
            let checksum_hex: Option<String> = row.get("checksum");
            let algorithm: Option<String> = row.get("algorithm");
            let checksum = match (checksum_hex, algorithm) {
                (Some(hex), Some(algorithm)) => Some(Checksum {
                    algorithm: ChecksumAlgorithm::parse(&algorithm)?,
                    hex,
                }),
                _ => None,
            };
            let local_path: String = row.get("local_path");
            let expected_size: Option<i64> = row.get("expected_size");
            requests.push(TransferRequest {
                direction: TransferDirection::parse(&direction)?,
                local_path: local_path.into(),
                url: row.get("url"),
                response_url: row.get("response_url"),
                token: row.get("token"),
                checksum,
                expected_size: expected_size.map(|size| size as u64),
                expiry: None,
                global: row.get("global"),
            });
        }
        Ok(requests)
    }

    pub async fn clear(&self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        sqlx::query("DELETE FROM Transfers")
            .execute(&mut *conn)
            .await
            .map_err(sqlite_error)?;
        Ok(())
    }
}

fn sqlite_error(e: sqlx::Error) -> AgentError {
    AgentError::new(ErrorKind::IoError, format!("transfer store: {e}"))
}
