use anyhow::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::time::UNIX_EPOCH;

use crate::audio::FileTags;

/// Tags read by `info`, keyed by path and invalidated when the file's
/// modification time changes.
pub struct TagsCache {
    conn: Mutex<Connection>,
}

impl TagsCache {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS tags (
                path TEXT PRIMARY KEY,
                mtime INTEGER NOT NULL,
                tags BLOB NOT NULL
            )",
            [],
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn get(&self, path: &Path) -> Result<Option<FileTags>> {
        let Some(mtime) = modification_time(path) else {
            return Ok(None);
        };
        let key = path.to_string_lossy();
        let conn = self.conn.lock();
        let row: Option<(i64, Vec<u8>)> = conn
            .query_row(
                "SELECT mtime, tags FROM tags WHERE path = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((cached, blob)) if cached == mtime => Ok(Some(bincode::deserialize(&blob)?)),
            _ => Ok(None),
        }
    }

    pub fn put(&self, path: &Path, tags: &FileTags) -> Result<()> {
        let Some(mtime) = modification_time(path) else {
            return Ok(());
        };
        let blob = bincode::serialize(tags)?;
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO tags (path, mtime, tags) VALUES (?1, ?2, ?3)",
            params![path.to_string_lossy(), mtime, blob],
        )?;
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        let count: i64 = self.conn.lock().query_row("SELECT COUNT(*) FROM tags", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

fn modification_time(path: &Path) -> Option<i64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    let since = modified.duration_since(UNIX_EPOCH).ok()?;
    Some(since.as_nanos() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_and_invalidation() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("song.wav");
        std::fs::write(&file, b"data").unwrap();

        let cache = TagsCache::open_in_memory().unwrap();
        assert!(cache.get(&file).unwrap().is_none());

        let mut tags = FileTags::default();
        tags.set("title", "Cached");
        tags.time = Some(42);
        cache.put(&file, &tags).unwrap();
        assert_eq!(cache.get(&file).unwrap(), Some(tags.clone()));
        assert_eq!(cache.len().unwrap(), 1);

        // a different mtime makes the entry stale
        let later = std::time::SystemTime::now() + std::time::Duration::from_secs(60);
        std::fs::File::options()
            .write(true)
            .open(&file)
            .unwrap()
            .set_modified(later)
            .unwrap();
        assert!(cache.get(&file).unwrap().is_none());

        // refreshing replaces the stale row
        cache.put(&file, &FileTags::default()).unwrap();
        assert_eq!(cache.get(&file).unwrap(), Some(FileTags::default()));
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[test]
    fn test_missing_file_is_not_cached() {
        let cache = TagsCache::open_in_memory().unwrap();
        let missing = Path::new("/no/such/file.ogg");
        cache.put(missing, &FileTags::default()).unwrap();
        assert!(cache.get(missing).unwrap().is_none());
        assert!(cache.is_empty().unwrap());
    }
}
