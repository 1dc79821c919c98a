/// Shared data structures for the application state
///
/// These structs represent the data model that flows between
/// the scanner, the catalog database and the reconciliation controller.
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::age::{self, AgeGroup, GroupedCollection};

/// Extensions recognized as photos (compared lowercase)
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "webp", "heic"];

/// Extensions recognized as videos (compared lowercase)
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "avi", "mkv", "wmv", "flv", "webm"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// Determine the kind from a file's extension, case-insensitive
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Some(MediaKind::Image)
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Some(MediaKind::Video)
        } else {
            None
        }
    }

    /// Name stored in the catalog's `file_type` column
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "image" => Some(MediaKind::Image),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }
}

/// A single photo or video found in the scanned folder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaFile {
    /// Absolute path, the identity key across rescans
    pub path: PathBuf,
    /// Filename only (e.g., "IMG_0001.JPG")
    pub name: String,
    pub kind: MediaKind,
    /// Capture time, Unix seconds
    pub captured_at: i64,
    /// Last filesystem modification, Unix seconds
    pub modified_at: i64,
    /// Derived from `captured_at` and the reference date, never persisted
    pub age_group: AgeGroup,
    /// Cached thumbnail (images only, None until derived)
    pub thumbnail_path: Option<PathBuf>,
    /// User note, owned by the annotation store
    pub note: Option<String>,
}

impl MediaFile {
    /// Recompute the age group against a (possibly new) reference date
    pub fn reclassify(&mut self, reference_date: Option<NaiveDate>) {
        self.age_group = age::classify(self.captured_at, reference_date);
    }

    /// Images without a thumbnail yet
    pub fn needs_thumbnail(&self) -> bool {
        self.kind == MediaKind::Image && self.thumbnail_path.is_none()
    }
}

/// User settings mirrored from the settings store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Birth date used as the reference for age groups
    pub reference_date: Option<NaiveDate>,
    /// Folder holding the photos and videos
    pub folder_path: Option<PathBuf>,
}

/// The complete published result of one scan + merge cycle
///
/// Snapshots are immutable once published; readers hold an `Arc` to the
/// version they were handed. Generation 0 is the catalog loaded at startup.
///
/// Each path also remembers the generation since which it has been present
/// without a gap. A file that drops out of one scan and comes back in a
/// later one starts a new run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Snapshot {
    pub generation: u64,
    pub reference_date: Option<NaiveDate>,
    pub folder: Option<PathBuf>,
    files: BTreeMap<PathBuf, MediaFile>,
    #[serde(skip)]
    present_since: BTreeMap<PathBuf, u64>,
}

impl Snapshot {
    pub fn new(
        generation: u64,
        reference_date: Option<NaiveDate>,
        folder: Option<PathBuf>,
        files: impl IntoIterator<Item = MediaFile>,
    ) -> Self {
        let files: BTreeMap<PathBuf, MediaFile> =
            files.into_iter().map(|f| (f.path.clone(), f)).collect();
        let present_since = files.keys().map(|p| (p.clone(), generation)).collect();
        Self {
            generation,
            reference_date,
            folder,
            files,
            present_since,
        }
    }

    /// Keep the presence runs of paths that `previous` already held
    pub(crate) fn continue_presence(&mut self, previous: &Snapshot) {
        for (path, since) in self.present_since.iter_mut() {
            if let Some(&earlier) = previous.present_since.get(path) {
                *since = earlier;
            }
        }
    }

    /// Generation since which `path` has been present without a gap
    pub fn present_since(&self, path: &Path) -> Option<u64> {
        self.present_since.get(path).copied()
    }

    /// Whether a thumbnail derived for `path` by a task that `generation`
    /// spawned still belongs to the file this snapshot holds at that path
    pub fn accepts_thumbnail_from(&self, path: &Path, generation: u64) -> bool {
        self.present_since(path).is_some_and(|since| since <= generation)
    }

    pub fn get(&self, path: &Path) -> Option<&MediaFile> {
        self.files.get(path)
    }

    pub(crate) fn get_mut(&mut self, path: &Path) -> Option<&mut MediaFile> {
        self.files.get_mut(path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.files.contains_key(path)
    }

    /// Files ordered by path
    pub fn files(&self) -> impl Iterator<Item = &MediaFile> {
        self.files.values()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Files grouped by age group for display
    pub fn grouped(&self) -> GroupedCollection {
        GroupedCollection::from_files(self.files.values())
    }

    /// Distinct age groups present, in display order
    pub fn age_groups(&self) -> Vec<AgeGroup> {
        let mut groups: Vec<AgeGroup> = self.files.values().map(|f| f.age_group).collect();
        groups.sort();
        groups.dedup();
        groups
    }

    /// Image paths still waiting for a thumbnail
    pub fn pending_thumbnails(&self) -> Vec<PathBuf> {
        self.files
            .values()
            .filter(|f| f.needs_thumbnail())
            .map(|f| f.path.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(path: &str, kind: MediaKind) -> MediaFile {
        MediaFile {
            path: PathBuf::from(path),
            name: path.rsplit('/').next().unwrap_or_default().to_string(),
            kind,
            captured_at: 0,
            modified_at: 0,
            age_group: AgeGroup::Unset,
            thumbnail_path: None,
            note: None,
        }
    }

    #[test]
    fn test_kind_from_extension_is_case_insensitive() {
        assert_eq!(MediaKind::from_path(Path::new("/x/A.JPG")), Some(MediaKind::Image));
        assert_eq!(MediaKind::from_path(Path::new("/x/b.HeIc")), Some(MediaKind::Image));
        assert_eq!(MediaKind::from_path(Path::new("/x/c.MoV")), Some(MediaKind::Video));
        assert_eq!(MediaKind::from_path(Path::new("/x/notes.txt")), None);
        assert_eq!(MediaKind::from_path(Path::new("/x/jpg")), None);
    }

    #[test]
    fn test_kind_db_names() {
        for kind in [MediaKind::Image, MediaKind::Video] {
            assert_eq!(MediaKind::from_db(kind.as_str()), Some(kind));
        }
        assert_eq!(MediaKind::from_db("audio"), None);
    }

    #[test]
    fn test_pending_thumbnails_skips_videos_and_derived() {
        let mut done = record("/p/b.jpg", MediaKind::Image);
        done.thumbnail_path = Some(PathBuf::from("/cache/b.jpg"));
        let snapshot = Snapshot::new(
            1,
            None,
            None,
            vec![
                record("/p/a.jpg", MediaKind::Image),
                done,
                record("/p/c.mp4", MediaKind::Video),
            ],
        );

        assert_eq!(snapshot.pending_thumbnails(), vec![PathBuf::from("/p/a.jpg")]);
    }

    #[test]
    fn test_presence_runs_restart_after_a_gap() {
        let first = Snapshot::new(
            1,
            None,
            None,
            vec![record("/p/kept.jpg", MediaKind::Image), record("/p/gone.jpg", MediaKind::Image)],
        );
        let mut second = Snapshot::new(2, None, None, vec![record("/p/kept.jpg", MediaKind::Image)]);
        second.continue_presence(&first);
        let mut third = Snapshot::new(
            3,
            None,
            None,
            vec![record("/p/kept.jpg", MediaKind::Image), record("/p/gone.jpg", MediaKind::Image)],
        );
        third.continue_presence(&second);

        assert_eq!(third.present_since(Path::new("/p/kept.jpg")), Some(1));
        assert_eq!(third.present_since(Path::new("/p/gone.jpg")), Some(3));
        assert!(third.accepts_thumbnail_from(Path::new("/p/kept.jpg"), 1));
        assert!(!third.accepts_thumbnail_from(Path::new("/p/gone.jpg"), 1));
        assert!(third.accepts_thumbnail_from(Path::new("/p/gone.jpg"), 3));
        assert!(!third.accepts_thumbnail_from(Path::new("/p/missing.jpg"), 3));
    }

    #[test]
    fn test_reclassify_tracks_reference_date() {
        let mut file = record("/p/a.jpg", MediaKind::Image);
        file.captured_at = NaiveDate::from_ymd_opt(2023, 3, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp();

        file.reclassify(NaiveDate::from_ymd_opt(2023, 1, 1));
        assert_eq!(file.age_group, AgeGroup::Elapsed { months: 2 });

        file.reclassify(None);
        assert_eq!(file.age_group, AgeGroup::Unset);
    }
}
