/// Application paths and runtime options
///
/// The catalog database lives in the user data directory and thumbnails
/// in the user cache directory:
/// - Linux: ~/.local/share/growth-album/ and ~/.cache/growth-album/thumbnails
/// - macOS: ~/Library/Application Support/growth-album/ and ~/Library/Caches/growth-album/thumbnails
/// - Windows: %APPDATA%\growth-album\ and %LOCALAPPDATA%\growth-album\thumbnails
use chrono::NaiveDate;
use std::path::{Path, PathBuf};

use crate::reconcile::Trigger;
use crate::state::data::Settings;

const APP_DIR: &str = "growth-album";
const DB_FILE: &str = "growth_album.db";

/// Default edge length of generated thumbnails, in pixels
pub const DEFAULT_THUMBNAIL_SIZE: u32 = 300;

/// Default number of thumbnails derived at the same time
pub const DEFAULT_THUMBNAIL_WORKERS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl AppPaths {
    /// Platform default locations. Falls back to the home directory, then
    /// the working directory, when the platform reports none.
    pub fn platform_default() -> Self {
        let data_dir = dirs::data_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);
        let cache_dir = dirs_next::cache_dir()
            .or_else(dirs_next::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);
        Self { data_dir, cache_dir }
    }

    /// Keep everything under one directory (tests, portable installs)
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            data_dir: root.to_path_buf(),
            cache_dir: root.join("cache"),
        }
    }

    pub fn database(&self) -> PathBuf {
        self.data_dir.join(DB_FILE)
    }

    pub fn thumbnails(&self) -> PathBuf {
        self.cache_dir.join("thumbnails")
    }
}

/// How the scanner walks a folder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOptions {
    /// Symlinks are not traversed by default, which rules out cycles
    pub follow_links: bool,
    /// None = unlimited recursion
    pub max_depth: Option<usize>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            follow_links: false,
            max_depth: None,
        }
    }
}

/// The folder and reference date a scan runs against
///
/// Owned by the reconciliation worker and handed to every scan by value.
/// `version` increases with every change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanConfig {
    pub folder: Option<PathBuf>,
    pub reference_date: Option<NaiveDate>,
    pub version: u64,
}

impl ScanConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            folder: settings.folder_path.clone(),
            reference_date: settings.reference_date,
            version: 0,
        }
    }

    /// Fold a trigger into the config; returns whether anything changed
    pub fn apply(&mut self, trigger: &Trigger) -> bool {
        let changed = match trigger {
            Trigger::FolderChanged(folder) if self.folder.as_ref() != Some(folder) => {
                self.folder = Some(folder.clone());
                true
            }
            Trigger::ReferenceDateChanged(date) if self.reference_date != Some(*date) => {
                self.reference_date = Some(*date);
                true
            }
            _ => false,
        };
        if changed {
            self.version += 1;
        }
        changed
    }

    /// Both the folder and the reference date are known
    pub fn is_complete(&self) -> bool {
        self.folder.is_some() && self.reference_date.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rooted_paths() {
        let paths = AppPaths::rooted_at(Path::new("/tmp/album"));
        assert_eq!(paths.database(), PathBuf::from("/tmp/album/growth_album.db"));
        assert_eq!(paths.thumbnails(), PathBuf::from("/tmp/album/cache/thumbnails"));
    }

    #[test]
    fn test_apply_bumps_version_only_on_change() {
        let mut config = ScanConfig::default();
        let date = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap();

        assert!(config.apply(&Trigger::ReferenceDateChanged(date)));
        assert!(!config.apply(&Trigger::ReferenceDateChanged(date)));
        assert!(!config.apply(&Trigger::Rescan));
        assert!(config.apply(&Trigger::FolderChanged(PathBuf::from("/photos"))));

        assert_eq!(config.version, 2);
        assert!(config.is_complete());
    }
}
