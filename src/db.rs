use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

use crate::error::{MetacleanError, Result};
use crate::models::{BookPatch, BookRecord};

const CURRENT_DB_VERSION: u32 = 1;

/// Append-only log of books that finished the pipeline.
pub struct History {
    conn: Connection,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub id: String,
    pub dedup_key: String,
    pub file_name: String,
    pub sha256: Option<String>,
    pub metadata: BookPatch,
    pub processed_at: String,
}

impl History {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            if !dir.exists() {
                fs::create_dir_all(dir).map_err(|err| MetacleanError::io(dir, err))?;
            }
        }
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT
            )",
            [],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO meta (key, value) VALUES ('db_version', ?1)",
            params![CURRENT_DB_VERSION.to_string()],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS processed_books (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL,
                dedup_key TEXT NOT NULL,
                file_name TEXT NOT NULL,
                sha256 TEXT,
                metadata_json TEXT NOT NULL,
                processed_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_processed_books_dedup ON processed_books(dedup_key)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_processed_books_sha ON processed_books(sha256)",
            [],
        )?;
        Ok(Self { conn })
    }

    pub fn record(&self, book: &BookRecord) -> Result<()> {
        let metadata = BookPatch {
            source_url: book.source_url.clone(),
            title: book.title.clone(),
            author: book.author.clone(),
            series: book.series.clone(),
            series_index: book.series_index,
            publish_info: book.publish_info.clone(),
            scraped_cover_url: book.scraped_cover_url.clone(),
        };
        let sha256 = match hash_file(&book.file_path) {
            Ok(value) => Some(value),
            Err(err) => {
                log::warn!("could not hash {}: {}", book.file_path.display(), err);
                None
            }
        };
        self.conn.execute(
            "INSERT INTO processed_books (id, dedup_key, file_name, sha256, metadata_json, processed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                book.id,
                book.dedup_key(),
                book.file_name(),
                sha256,
                serde_json::to_string(&metadata)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn contains(&self, dedup_key: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT seq FROM processed_books WHERE dedup_key = ?1 LIMIT 1",
                params![dedup_key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn contains_file(&self, path: &Path) -> Result<bool> {
        let sha = hash_file(path).map_err(|err| MetacleanError::io(path, err))?;
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT seq FROM processed_books WHERE sha256 = ?1 LIMIT 1",
                params![sha],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Most recent entries first.
    pub fn entries(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, dedup_key, file_name, sha256, metadata_json, processed_at
             FROM processed_books ORDER BY seq DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, dedup_key, file_name, sha256, metadata_json, processed_at) = row?;
            entries.push(HistoryEntry {
                id,
                dedup_key,
                file_name,
                sha256,
                metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
                processed_at,
            });
        }
        Ok(entries)
    }
}

fn hash_file(path: &Path) -> std::result::Result<String, std::io::Error> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = std::io::Read::read(&mut file, &mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect())
}
