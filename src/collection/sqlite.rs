//! SQLite-backed image collection.
//!
//! Records live in a single `images` table ordered by
//! `COALESCE("order", crawled_at)`, with the id as tie breaker so slices are
//! stable across calls.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use directories::ProjectDirs;
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row, Transaction};
use tokio::task;
use tracing::{debug, info, warn};

use super::{CollectionService, Slice};
use crate::models::{ImageId, ImageRecord};

const SELECT_RECORD: &str = "
    SELECT id, local_path, thumbnail_path, crawled_at, favorite
    FROM images
    ORDER BY COALESCE(\"order\", crawled_at) ASC, id ASC
    LIMIT ?1 OFFSET ?2
";

/// Image collection stored in SQLite.
///
/// Cloning shares the connection. Async queries run on the blocking pool.
#[derive(Clone)]
pub struct SqliteCollection {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCollection {
    /// Opens or creates the collection at `XDG_DATA_HOME/gridcache/collection.sqlite`.
    pub fn open_default() -> Result<Self> {
        Self::open(&Self::default_db_path()?)
    }

    pub fn default_db_path() -> Result<PathBuf> {
        let proj_dirs =
            ProjectDirs::from("", "", "gridcache").context("Failed to determine project directories")?;
        Ok(proj_dirs.data_dir().join("collection.sqlite"))
    }

    /// Opens or creates the database at the specified path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory: {:?}", parent))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            ",
        )
        .context("Failed to configure SQLite pragmas")?;

        let collection = Self::from_connection(conn)?;
        info!("Opened image collection at {:?}", path);
        Ok(collection)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS images (
                id TEXT PRIMARY KEY NOT NULL,
                local_path TEXT NOT NULL,
                thumbnail_path TEXT,
                crawled_at INTEGER NOT NULL,
                favorite INTEGER NOT NULL DEFAULT 0,
                \"order\" INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_images_sort
                ON images(COALESCE(\"order\", crawled_at), id);
            ",
        )
        .context("Failed to create images table")?;

        debug!("Images table created/verified");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Inserts or updates records in a single transaction.
    pub fn insert_batch(&self, records: &[ImageRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let count = Self::insert_batch_in_tx(&tx, records)?;
        tx.commit()?;

        debug!("Batch inserted {} image records", count);
        Ok(count)
    }

    fn insert_batch_in_tx(tx: &Transaction, records: &[ImageRecord]) -> Result<usize> {
        let mut stmt = tx.prepare_cached(
            "
            INSERT INTO images (id, local_path, thumbnail_path, crawled_at, favorite)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                local_path = excluded.local_path,
                thumbnail_path = excluded.thumbnail_path,
                crawled_at = excluded.crawled_at
            ",
        )?;

        let mut count = 0;
        for record in records {
            // TEXT columns hold UTF-8 only; a lossy copy would point at another file.
            let Some(local_path) = record.local_path.to_str() else {
                warn!("Skipping record {} with non-UTF-8 path {:?}", record.id, record.local_path);
                continue;
            };
            let thumbnail_path = match record.declared_thumbnail() {
                Some(p) => match p.to_str() {
                    Some(p) => Some(p),
                    None => {
                        warn!("Skipping record {} with non-UTF-8 thumbnail {:?}", record.id, p);
                        continue;
                    }
                },
                None => None,
            };
            stmt.execute(params![
                record.id.as_str(),
                local_path,
                thumbnail_path,
                record.crawled_at,
                record.favorite,
            ])?;
            count += 1;
        }
        Ok(count)
    }

    /// Deletes records by id. Returns the number of rows removed.
    pub fn delete(&self, ids: &[ImageId]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut removed = 0;
        {
            let mut stmt = tx.prepare_cached("DELETE FROM images WHERE id = ?1")?;
            for id in ids {
                removed += stmt.execute(params![id.as_str()])?;
            }
        }
        tx.commit()?;
        if removed > 0 {
            info!("Deleted {} image records", removed);
        }
        Ok(removed)
    }

    /// Returns false if no record has this id.
    pub fn set_favorite(&self, id: &ImageId, favorite: bool) -> Result<bool> {
        let rows = self.conn.lock().execute(
            "UPDATE images SET favorite = ?2 WHERE id = ?1",
            params![id.as_str(), favorite],
        )?;
        Ok(rows > 0)
    }

    /// Pins a record to an explicit position; `None` falls back to crawl time.
    pub fn set_order(&self, id: &ImageId, order: Option<i64>) -> Result<bool> {
        let rows = self.conn.lock().execute(
            "UPDATE images SET \"order\" = ?2 WHERE id = ?1",
            params![id.as_str(), order],
        )?;
        Ok(rows > 0)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        Self::count_in(&conn)
    }

    fn count_in(conn: &Connection) -> Result<usize> {
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM images", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }

    /// Reads one slice and the total in the same snapshot.
    pub fn slice(&self, offset: usize, limit: usize) -> Result<Slice> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let records = {
            let mut stmt = tx.prepare_cached(SELECT_RECORD)?;
            let rows = stmt.query_map(params![limit as i64, offset as i64], record_from_row)?;
            rows.collect::<Result<Vec<_>, _>>()
                .context("Failed to read image slice")?
        };
        let total = Self::count_in(&tx)?;
        tx.commit()?;
        Ok(Slice { records, total })
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<ImageRecord> {
    Ok(ImageRecord {
        id: ImageId::from(row.get::<_, String>(0)?),
        local_path: PathBuf::from(row.get::<_, String>(1)?),
        thumbnail_path: row
            .get::<_, Option<String>>(2)?
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from),
        crawled_at: row.get(3)?,
        favorite: row.get(4)?,
    })
}

#[async_trait]
impl CollectionService for SqliteCollection {
    async fn fetch_slice(&self, offset: usize, limit: usize) -> Result<Slice> {
        let this = self.clone();
        task::spawn_blocking(move || this.slice(offset, limit))
            .await
            .context("Slice query panicked")?
    }
}
