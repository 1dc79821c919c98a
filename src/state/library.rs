use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::data::{MediaFile, MediaKind, Settings};
use crate::age::AgeGroup;
use crate::error::PersistenceError;

type Result<T> = std::result::Result<T, PersistenceError>;

const SETTING_REFERENCE_DATE: &str = "baby_birth_date";
const SETTING_FOLDER_PATH: &str = "folder_path";
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Paths are stored as UTF-8 text. A lossy rendering could map two
/// distinct paths onto one row, so other paths are refused.
fn db_key(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| PersistenceError::NonUtf8Path(path.to_path_buf()))
}

/// The Library manages the SQLite catalog database.
/// It stores scanned file records, user notes and settings.
///
/// Notes live in their own table keyed by path so they survive rescans
/// that drop and later re-add a file. Age groups are never stored.
pub struct Library {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

impl Library {
    /// Open (or create) the catalog at `db_path`
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| PersistenceError::Directory {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(db_path)?;
        info!(path = %db_path.display(), "catalog opened");

        let library = Library {
            conn: Mutex::new(conn),
            db_path: Some(db_path.to_path_buf()),
        };
        library.init_schema()?;
        Ok(library)
    }

    /// A catalog that lives only as long as this value
    pub fn open_in_memory() -> Result<Self> {
        let library = Library {
            conn: Mutex::new(Connection::open_in_memory()?),
            db_path: None,
        };
        library.init_schema()?;
        Ok(library)
    }

    /// Path to the database file (None for in-memory catalogs)
    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| PersistenceError::Poisoned)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS media_files (
                path            TEXT PRIMARY KEY,
                file_name       TEXT NOT NULL,
                file_type       TEXT NOT NULL,
                captured_at     INTEGER NOT NULL,
                modified_at     INTEGER NOT NULL,
                thumbnail_path  TEXT
            );
            CREATE TABLE IF NOT EXISTS notes (
                path            TEXT PRIMARY KEY,
                note            TEXT NOT NULL,
                updated_at      INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS settings (
                key             TEXT PRIMARY KEY,
                value           TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_media_files_captured_at
                ON media_files(captured_at);",
        )?;
        debug!("catalog schema initialized");
        Ok(())
    }

    // ========== Settings ==========

    /// Read the stored settings. A stored date that fails to parse is
    /// treated as absent.
    pub fn settings(&self) -> Result<Settings> {
        let reference_date = self
            .get_setting(SETTING_REFERENCE_DATE)?
            .and_then(|raw| match NaiveDate::parse_from_str(&raw, DATE_FORMAT) {
                Ok(date) => Some(date),
                Err(e) => {
                    warn!(value = %raw, error = %e, "ignoring unparseable reference date");
                    None
                }
            });
        let folder_path = self.get_setting(SETTING_FOLDER_PATH)?.map(PathBuf::from);

        Ok(Settings {
            reference_date,
            folder_path,
        })
    }

    /// Store whichever settings are present; absent fields keep their
    /// stored value
    pub fn save_settings(&self, settings: &Settings) -> Result<()> {
        if let Some(date) = settings.reference_date {
            self.put_setting(SETTING_REFERENCE_DATE, &date.format(DATE_FORMAT).to_string())?;
        }
        if let Some(folder) = &settings.folder_path {
            self.put_setting(SETTING_FOLDER_PATH, db_key(folder)?)?;
        }
        Ok(())
    }

    fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    // ========== Notes ==========

    /// Attach a note to a path. The path need not be in the catalog.
    pub fn set_note(&self, path: &Path, text: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO notes (path, note, updated_at) VALUES (?1, ?2, ?3)",
            params![db_key(path)?, text, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    pub fn get_note(&self, path: &Path) -> Result<Option<String>> {
        let conn = self.conn()?;
        let note = conn
            .query_row(
                "SELECT note FROM notes WHERE path = ?1",
                [db_key(path)?],
                |row| row.get(0),
            )
            .optional()?;
        Ok(note)
    }

    /// Remove a note. Returns whether one existed.
    pub fn clear_note(&self, path: &Path) -> Result<bool> {
        let conn = self.conn()?;
        let removed = conn.execute("DELETE FROM notes WHERE path = ?1", [db_key(path)?])?;
        Ok(removed > 0)
    }

    /// Every stored note keyed by path
    pub fn all_notes(&self) -> Result<HashMap<PathBuf, String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT path, note FROM notes")?;
        let notes = stmt
            .query_map([], |row| {
                Ok((PathBuf::from(row.get::<_, String>(0)?), row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<HashMap<_, _>>>()?;
        Ok(notes)
    }

    // ========== File records ==========

    /// Load the persisted file records. Age groups come back as `Unset`
    /// and notes as None; the caller reclassifies and merges notes.
    pub fn load_records(&self) -> Result<Vec<MediaFile>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT path, file_name, file_type, captured_at, modified_at, thumbnail_path
             FROM media_files ORDER BY path",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;

        let mut files = Vec::new();
        for row in rows {
            let (path, name, file_type, captured_at, modified_at, thumbnail) = row?;
            let Some(kind) = MediaKind::from_db(&file_type) else {
                warn!(path = %path, file_type = %file_type, "skipping record with unknown file type");
                continue;
            };
            files.push(MediaFile {
                path: PathBuf::from(path),
                name,
                kind,
                captured_at,
                modified_at,
                age_group: AgeGroup::Unset,
                thumbnail_path: thumbnail.map(PathBuf::from),
                note: None,
            });
        }
        Ok(files)
    }

    /// Replace the whole set of file records with `files`
    pub fn replace_records<'a>(&self, files: impl IntoIterator<Item = &'a MediaFile>) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM media_files", [])?;

        let mut count = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO media_files (path, file_name, file_type, captured_at, modified_at, thumbnail_path)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for file in files {
                stmt.execute(params![
                    db_key(&file.path)?,
                    file.name,
                    file.kind.as_str(),
                    file.captured_at,
                    file.modified_at,
                    file.thumbnail_path.as_deref().map(db_key).transpose()?,
                ])?;
                count += 1;
            }
        }

        tx.commit()?;
        debug!(count, "catalog records replaced");
        Ok(count)
    }

    /// Record a derived thumbnail for a file
    pub fn set_thumbnail(&self, path: &Path, thumbnail: &Path) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE media_files SET thumbnail_path = ?1 WHERE path = ?2",
            params![db_key(thumbnail)?, db_key(path)?],
        )?;
        Ok(())
    }

    /// Verify cached thumbnails actually exist on disk.
    /// Clears the path of any that are missing so they get derived again.
    pub fn verify_thumbnails(&self) -> Result<usize> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT path, thumbnail_path FROM media_files WHERE thumbnail_path IS NOT NULL")?;
        let cached: Vec<(String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?;

        let mut reset_count = 0;
        for (path, thumbnail) in cached {
            if !Path::new(&thumbnail).exists() {
                conn.execute(
                    "UPDATE media_files SET thumbnail_path = NULL WHERE path = ?1",
                    [&path],
                )?;
                reset_count += 1;
            }
        }

        if reset_count > 0 {
            info!(reset_count, "cleared missing thumbnails");
        }
        Ok(reset_count)
    }
}

impl std::fmt::Debug for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Library").field("db_path", &self.db_path).finish()
    }
}
