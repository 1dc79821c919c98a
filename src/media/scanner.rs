/// Media scanner
///
/// Walks a folder, keeps files whose extension marks them as a photo or a
/// video, and reads their timestamps. A file whose timestamps cannot be
/// read is logged and left out; it never fails the scan.
use chrono::NaiveDate;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::age;
use crate::config::ScanOptions;
use crate::error::{MetadataError, ScanError};
use crate::state::data::{MediaFile, MediaKind};

/// Timestamps read for one file, Unix seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamps {
    pub captured_at: i64,
    pub modified_at: i64,
}

/// Source of capture/modification times for a file
pub trait CaptureProbe: Send + Sync {
    fn probe(&self, path: &Path, kind: MediaKind) -> Result<Timestamps, MetadataError>;
}

/// Reads timestamps from the filesystem, preferring the EXIF
/// `DateTimeOriginal` tag for photos that carry one
#[derive(Debug, Clone, Copy)]
pub struct FsCaptureProbe {
    pub prefer_exif: bool,
}

impl Default for FsCaptureProbe {
    fn default() -> Self {
        Self { prefer_exif: true }
    }
}

impl CaptureProbe for FsCaptureProbe {
    fn probe(&self, path: &Path, kind: MediaKind) -> Result<Timestamps, MetadataError> {
        let metadata = fs::metadata(path).map_err(|source| MetadataError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let modified_at = metadata
            .modified()
            .ok()
            .and_then(unix_seconds)
            .ok_or_else(|| MetadataError::NoTimestamp(path.to_path_buf()))?;

        let exif_time = if self.prefer_exif && kind == MediaKind::Image {
            exif_capture_time(path)
        } else {
            None
        };

        // Creation time is not available on every filesystem
        let captured_at = exif_time
            .or_else(|| metadata.created().ok().and_then(unix_seconds))
            .unwrap_or(modified_at);

        Ok(Timestamps {
            captured_at,
            modified_at,
        })
    }
}

fn unix_seconds(time: SystemTime) -> Option<i64> {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_secs()).ok(),
        Err(e) => i64::try_from(e.duration().as_secs()).ok().map(|s| -s),
    }
}

/// `DateTimeOriginal` from the photo's EXIF block, read as UTC
fn exif_capture_time(path: &Path) -> Option<i64> {
    let file = File::open(path).ok()?;
    let mut reader = BufReader::new(file);
    let exif = exif::Reader::new().read_from_container(&mut reader).ok()?;

    let field = exif
        .get_field(exif::Tag::DateTimeOriginal, exif::In::PRIMARY)
        .or_else(|| exif.get_field(exif::Tag::DateTime, exif::In::PRIMARY))?;

    let exif::Value::Ascii(ref values) = field.value else {
        return None;
    };
    let raw = values.first()?;
    let dt = exif::DateTime::from_ascii(raw).ok()?;

    let date = NaiveDate::from_ymd_opt(i32::from(dt.year), u32::from(dt.month), u32::from(dt.day))?;
    let time = date.and_hms_opt(u32::from(dt.hour), u32::from(dt.minute), u32::from(dt.second))?;
    Some(time.and_utc().timestamp())
}

/// Scan `folder` and classify every photo and video against
/// `reference_date`
pub fn scan(
    folder: &Path,
    reference_date: Option<NaiveDate>,
    options: &ScanOptions,
    probe: &dyn CaptureProbe,
) -> Result<Vec<MediaFile>, ScanError> {
    let metadata = fs::metadata(folder).map_err(|e| ScanError::from_io(folder.to_path_buf(), e))?;
    if !metadata.is_dir() {
        return Err(ScanError::NotFound(folder.to_path_buf()));
    }
    // Surface an unreadable root as a scan failure instead of an empty result
    fs::read_dir(folder).map_err(|e| ScanError::from_io(folder.to_path_buf(), e))?;

    info!(folder = %folder.display(), "scanning folder");

    let mut walker = WalkDir::new(folder).follow_links(options.follow_links);
    if let Some(depth) = options.max_depth {
        walker = walker.max_depth(depth);
    }

    let mut files = Vec::new();
    let mut skipped = 0usize;

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let Some(kind) = MediaKind::from_path(path) else {
            continue;
        };
        // The catalog keys files by their UTF-8 path
        if path.to_str().is_none() {
            warn!(path = %path.display(), "skipping file whose path is not UTF-8");
            skipped += 1;
            continue;
        }

        let timestamps = match probe.probe(path, kind) {
            Ok(t) => t,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping file without metadata");
                skipped += 1;
                continue;
            }
        };

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        files.push(MediaFile {
            path: path.to_path_buf(),
            name,
            kind,
            captured_at: timestamps.captured_at,
            modified_at: timestamps.modified_at,
            age_group: age::classify(timestamps.captured_at, reference_date),
            thumbnail_path: None,
            note: None,
        });
    }

    debug!(found = files.len(), skipped, "scan finished");
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::age::AgeGroup;
    use std::collections::HashMap;
    use std::path::PathBuf;

    /// Returns fixed timestamps per file name and fails for the rest
    struct FixedProbe(HashMap<&'static str, i64>);

    impl CaptureProbe for FixedProbe {
        fn probe(&self, path: &Path, _kind: MediaKind) -> Result<Timestamps, MetadataError> {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            self.0
                .get(name)
                .map(|&t| Timestamps {
                    captured_at: t,
                    modified_at: t,
                })
                .ok_or_else(|| MetadataError::NoTimestamp(path.to_path_buf()))
        }
    }

    fn ts(y: i32, m: u32, d: u32) -> i64 {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp()
    }

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, b"data").unwrap();
        path
    }

    #[test]
    fn test_missing_folder_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let err = scan(&missing, None, &ScanOptions::default(), &FsCaptureProbe::default()).unwrap_err();
        assert!(matches!(err, ScanError::NotFound(p) if p == missing));
    }

    #[test]
    fn test_file_as_folder_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let file = touch(dir.path(), "a.jpg");
        let err = scan(&file, None, &ScanOptions::default(), &FsCaptureProbe::default()).unwrap_err();
        assert!(matches!(err, ScanError::NotFound(_)));
    }

    #[test]
    fn test_classifies_by_extension_and_recurses() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "a.PNG");
        touch(dir.path(), "nested/deeper/b.mp4");
        touch(dir.path(), "readme.txt");
        touch(dir.path(), "noext");

        let probe = FixedProbe(HashMap::from([("a.PNG", ts(2022, 12, 1)), ("b.mp4", ts(2023, 1, 20))]));
        let reference = NaiveDate::from_ymd_opt(2023, 1, 1);
        let mut files = scan(dir.path(), reference, &ScanOptions::default(), &probe).unwrap();
        files.sort_by(|a, b| a.name.cmp(&b.name));

        assert_eq!(files.len(), 2);
        assert_eq!(files[0].name, "a.PNG");
        assert_eq!(files[0].kind, MediaKind::Image);
        assert_eq!(files[0].age_group, AgeGroup::Prenatal);
        assert_eq!(files[1].name, "b.mp4");
        assert_eq!(files[1].kind, MediaKind::Video);
        assert_eq!(files[1].age_group, AgeGroup::Elapsed { months: 0 });
        assert!(files.iter().all(|f| f.thumbnail_path.is_none() && f.note.is_none()));
    }

    #[test]
    fn test_metadata_failure_skips_only_that_file() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "one.jpg");
        touch(dir.path(), "two.jpg");
        touch(dir.path(), "broken.jpg");

        let probe = FixedProbe(HashMap::from([("one.jpg", 10), ("two.jpg", 20)]));
        let files = scan(dir.path(), None, &ScanOptions::default(), &probe).unwrap();

        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.name != "broken.jpg"));
        assert!(files.iter().all(|f| f.age_group == AgeGroup::Unset));
    }

    #[test]
    fn test_max_depth_limits_recursion() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "top.jpg");
        touch(dir.path(), "sub/inner.jpg");

        let probe = FixedProbe(HashMap::from([("top.jpg", 1), ("inner.jpg", 2)]));
        let options = ScanOptions {
            max_depth: Some(1),
            ..ScanOptions::default()
        };
        let files = scan(dir.path(), None, &options, &probe).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "top.jpg");
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_directories_are_not_followed() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "real/a.jpg");
        std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("link")).unwrap();

        let probe = FixedProbe(HashMap::from([("a.jpg", 1)]));
        let files = scan(dir.path(), None, &ScanOptions::default(), &probe).unwrap();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_fs_probe_falls_back_to_filesystem_times() {
        let dir = tempfile::tempdir().unwrap();
        let path = touch(dir.path(), "plain.jpg");

        let times = FsCaptureProbe::default().probe(&path, MediaKind::Image).unwrap();
        assert!(times.modified_at > 0);
        assert!(times.captured_at > 0);
    }

    #[test]
    fn test_fs_probe_missing_file_is_metadata_error() {
        let err = FsCaptureProbe::default()
            .probe(Path::new("/definitely/not/here.jpg"), MediaKind::Image)
            .unwrap_err();
        assert!(matches!(err, MetadataError::Io { .. }));
    }

    /// JPEG bytes carrying an EXIF block with the given ASCII tag values
    fn jpeg_with_exif(tags: &[(exif::Tag, &str)]) -> Vec<u8> {
        use exif::experimental::Writer;
        use exif::{Field, In, Value};
        use image::{DynamicImage, ImageFormat, RgbImage};
        use std::io::Cursor;

        let fields: Vec<Field> = tags
            .iter()
            .map(|(tag, value)| Field {
                tag: *tag,
                ifd_num: In::PRIMARY,
                value: Value::Ascii(vec![value.as_bytes().to_vec()]),
            })
            .collect();
        let mut writer = Writer::new();
        for field in &fields {
            writer.push_field(field);
        }
        let mut tiff = Cursor::new(Vec::new());
        writer.write(&mut tiff, false).unwrap();
        let tiff = tiff.into_inner();

        let mut jpeg = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::new(8, 8))
            .write_to(&mut Cursor::new(&mut jpeg), ImageFormat::Jpeg)
            .unwrap();

        // APP1 segment right after SOI
        let length = u16::try_from(2 + 6 + tiff.len()).unwrap();
        let mut out = jpeg[..2].to_vec();
        out.extend_from_slice(&[0xFF, 0xE1]);
        out.extend_from_slice(&length.to_be_bytes());
        out.extend_from_slice(b"Exif\0\0");
        out.extend_from_slice(&tiff);
        out.extend_from_slice(&jpeg[2..]);
        out
    }

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> i64 {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, s)
            .unwrap()
            .and_utc()
            .timestamp()
    }

    #[test]
    fn test_fs_probe_reads_exif_capture_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("IMG_0001.jpg");
        fs::write(
            &path,
            jpeg_with_exif(&[
                (exif::Tag::DateTimeOriginal, "2021:06:15 08:30:00"),
                (exif::Tag::DateTime, "2024:01:01 00:00:00"),
            ]),
        )
        .unwrap();

        let times = FsCaptureProbe::default().probe(&path, MediaKind::Image).unwrap();
        assert_eq!(times.captured_at, utc(2021, 6, 15, 8, 30, 0));
        // The file itself was just written
        assert!(times.modified_at > times.captured_at);

        let reference = NaiveDate::from_ymd_opt(2021, 1, 20);
        let files = scan(dir.path(), reference, &ScanOptions::default(), &FsCaptureProbe::default()).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].age_group, AgeGroup::Elapsed { months: 4 });
    }

    #[test]
    fn test_fs_probe_falls_back_to_exif_datetime_tag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edited.jpg");
        fs::write(&path, jpeg_with_exif(&[(exif::Tag::DateTime, "2020:02:29 23:59:59")])).unwrap();

        let times = FsCaptureProbe::default().probe(&path, MediaKind::Image).unwrap();
        assert_eq!(times.captured_at, utc(2020, 2, 29, 23, 59, 59));
    }

    #[test]
    fn test_fs_probe_ignores_exif_when_disabled_or_for_videos() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("IMG_0002.jpg");
        fs::write(
            &path,
            jpeg_with_exif(&[(exif::Tag::DateTimeOriginal, "2001:01:01 00:00:00")]),
        )
        .unwrap();
        let exif_time = utc(2001, 1, 1, 0, 0, 0);

        let off = FsCaptureProbe { prefer_exif: false };
        assert_ne!(off.probe(&path, MediaKind::Image).unwrap().captured_at, exif_time);
        assert_ne!(
            FsCaptureProbe::default().probe(&path, MediaKind::Video).unwrap().captured_at,
            exif_time
        );
    }

    #[test]
    fn test_unparseable_exif_date_falls_back_to_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("odd.jpg");
        fs::write(&path, jpeg_with_exif(&[(exif::Tag::DateTimeOriginal, "sometime in spring")])).unwrap();

        let times = FsCaptureProbe::default().probe(&path, MediaKind::Image).unwrap();
        assert!(times.captured_at > utc(2020, 1, 1, 0, 0, 0));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_non_utf8_file_names_are_skipped() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        /// Accepts every file
        struct AnyTime;

        impl CaptureProbe for AnyTime {
            fn probe(&self, _path: &Path, _kind: MediaKind) -> Result<Timestamps, MetadataError> {
                Ok(Timestamps {
                    captured_at: 1,
                    modified_at: 1,
                })
            }
        }

        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(OsStr::from_bytes(b"bad\xff.jpg")), b"data").unwrap();
        fs::write(dir.path().join(OsStr::from_bytes(b"bad\xfe.jpg")), b"data").unwrap();
        touch(dir.path(), "good.jpg");

        let files = scan(dir.path(), None, &ScanOptions::default(), &AnyTime).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "good.jpg");
    }
}
