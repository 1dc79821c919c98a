/// Age classification
///
/// Maps a capture timestamp and the reference (birth) date to an age group
/// and defines the display order of age groups.
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::state::data::MediaFile;

/// Ordinal used for `Unset`, greater than any real elapsed-months ordinal
const UNSET_ORDINAL: i64 = i64::MAX;

/// Bucket a file falls into relative to the reference date
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum AgeGroup {
    /// Captured strictly before the reference date
    Prenatal,
    /// Whole calendar months elapsed since the reference date
    Elapsed { months: u32 },
    /// No reference date configured
    Unset,
}

impl AgeGroup {
    /// Sort key: `Prenatal` = -1, elapsed months as-is, `Unset` last
    pub fn ordinal(&self) -> i64 {
        match self {
            AgeGroup::Prenatal => -1,
            AgeGroup::Elapsed { months } => i64::from(*months),
            AgeGroup::Unset => UNSET_ORDINAL,
        }
    }

    /// Build an elapsed group from a year/month pair, `None` when the total
    /// month count does not fit in a `u32`
    pub fn from_years_months(years: u32, months: u32) -> Option<Self> {
        let months = years.checked_mul(12)?.checked_add(months)?;
        Some(AgeGroup::Elapsed { months })
    }
}

impl Ord for AgeGroup {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ordinal().cmp(&other.ordinal())
    }
}

impl PartialOrd for AgeGroup {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for AgeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgeGroup::Prenatal => f.write_str("Prenatal"),
            AgeGroup::Unset => f.write_str("Unset"),
            AgeGroup::Elapsed { months } => {
                let years = months / 12;
                let months = months % 12;
                if years > 0 {
                    write!(f, "{} years {} months", years, months)
                } else {
                    write!(f, "{} months", months)
                }
            }
        }
    }
}

/// A label that does not match any rendering of `AgeGroup`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized age group label: {0:?}")]
pub struct ParseAgeGroupError(pub String);

impl FromStr for AgeGroup {
    type Err = ParseAgeGroupError;

    fn from_str(label: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseAgeGroupError(label.to_string());

        match label {
            "Prenatal" => return Ok(AgeGroup::Prenatal),
            "Unset" => return Ok(AgeGroup::Unset),
            _ => {}
        }

        let words: Vec<&str> = label.split_whitespace().collect();
        match words.as_slice() {
            [months, "months"] => {
                let months: u32 = months.parse().map_err(|_| invalid())?;
                if months >= 12 {
                    return Err(invalid());
                }
                Ok(AgeGroup::Elapsed { months })
            }
            [years, "years", months, "months"] => {
                let years: u32 = years.parse().map_err(|_| invalid())?;
                let months: u32 = months.parse().map_err(|_| invalid())?;
                if years == 0 || months >= 12 {
                    return Err(invalid());
                }
                AgeGroup::from_years_months(years, months).ok_or_else(invalid)
            }
            _ => Err(invalid()),
        }
    }
}

impl From<AgeGroup> for String {
    fn from(group: AgeGroup) -> Self {
        group.to_string()
    }
}

impl TryFrom<String> for AgeGroup {
    type Error = ParseAgeGroupError;

    fn try_from(label: String) -> Result<Self, Self::Error> {
        label.parse()
    }
}

/// Classify a capture timestamp (Unix seconds) against the reference date.
///
/// The file's calendar date is taken in UTC. Never fails: timestamps outside
/// chrono's range clamp to the earliest/latest representable date.
pub fn classify(captured_at: i64, reference_date: Option<NaiveDate>) -> AgeGroup {
    let Some(reference) = reference_date else {
        return AgeGroup::Unset;
    };

    let file_date = DateTime::from_timestamp(captured_at, 0)
        .unwrap_or(if captured_at < 0 {
            DateTime::<Utc>::MIN_UTC
        } else {
            DateTime::<Utc>::MAX_UTC
        })
        .date_naive();

    if file_date < reference {
        return AgeGroup::Prenatal;
    }

    AgeGroup::Elapsed {
        months: months_between(reference, file_date),
    }
}

/// Whole calendar months from `from` to `to` (`to` must not precede `from`).
///
/// A month counts once the day-of-month of `from` has been reached again.
pub fn months_between(from: NaiveDate, to: NaiveDate) -> u32 {
    let mut total = (to.year() - from.year()) * 12 + to.month() as i32 - from.month() as i32;
    if to.day() < from.day() {
        total -= 1;
    }
    total.max(0) as u32
}

/// Files bucketed by age group, iterated in display order
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct GroupedCollection {
    groups: BTreeMap<AgeGroup, Vec<MediaFile>>,
}

impl GroupedCollection {
    /// Group files by their `age_group`; files inside a group are ordered by
    /// capture time, then path
    pub fn from_files<'a>(files: impl IntoIterator<Item = &'a MediaFile>) -> Self {
        let mut groups: BTreeMap<AgeGroup, Vec<MediaFile>> = BTreeMap::new();
        for file in files {
            groups.entry(file.age_group).or_default().push(file.clone());
        }
        for members in groups.values_mut() {
            members.sort_by(|a, b| {
                a.captured_at
                    .cmp(&b.captured_at)
                    .then_with(|| a.path.cmp(&b.path))
            });
        }
        Self { groups }
    }

    /// Age group labels in display order
    pub fn labels(&self) -> Vec<AgeGroup> {
        self.groups.keys().copied().collect()
    }

    pub fn get(&self, group: &AgeGroup) -> &[MediaFile] {
        self.groups.get(group).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AgeGroup, &[MediaFile])> {
        self.groups.iter().map(|(group, files)| (group, files.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Number of files across all groups
    pub fn file_count(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::data::MediaKind;
    use std::path::PathBuf;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn ts(y: i32, m: u32, d: u32) -> i64 {
        date(y, m, d).and_hms_opt(12, 0, 0).unwrap().and_utc().timestamp()
    }

    fn file(path: &str, captured_at: i64, group: AgeGroup) -> MediaFile {
        MediaFile {
            path: PathBuf::from(path),
            name: path.trim_start_matches('/').to_string(),
            kind: MediaKind::Image,
            captured_at,
            modified_at: captured_at,
            age_group: group,
            thumbnail_path: None,
            note: None,
        }
    }

    #[test]
    fn test_no_reference_date_is_unset() {
        assert_eq!(classify(ts(2023, 5, 1), None), AgeGroup::Unset);
    }

    #[test]
    fn test_reference_date_itself_is_zero_months() {
        let group = classify(ts(2023, 1, 1), Some(date(2023, 1, 1)));
        assert_eq!(group, AgeGroup::Elapsed { months: 0 });
        assert_eq!(group.to_string(), "0 months");
    }

    #[test]
    fn test_before_reference_is_prenatal() {
        let group = classify(ts(2022, 12, 31), Some(date(2023, 1, 1)));
        assert_eq!(group, AgeGroup::Prenatal);
        assert!(group < AgeGroup::Elapsed { months: 0 });
    }

    #[test]
    fn test_calendar_months_not_thirty_day_buckets() {
        // 31 days later but the day-of-month has not come round yet
        let group = classify(ts(2023, 3, 14), Some(date(2023, 2, 15)));
        assert_eq!(group.to_string(), "0 months");

        let group = classify(ts(2023, 3, 15), Some(date(2023, 2, 15)));
        assert_eq!(group.to_string(), "1 months");
    }

    #[test]
    fn test_reference_change_moves_group() {
        let captured = ts(2023, 7, 15);
        assert_eq!(classify(captured, Some(date(2023, 1, 1))).to_string(), "6 months");
        assert_eq!(classify(captured, Some(date(2023, 6, 1))).to_string(), "1 months");
    }

    #[test]
    fn test_year_rollover() {
        let group = classify(ts(2023, 2, 20), Some(date(2022, 1, 15)));
        assert_eq!(group.to_string(), "1 years 1 months");
        assert_eq!(group.ordinal(), 13);
    }

    #[test]
    fn test_whole_years_render_zero_months() {
        let group = classify(ts(2024, 3, 10), Some(date(2022, 3, 10)));
        assert_eq!(group.to_string(), "2 years 0 months");
    }

    #[test]
    fn test_ordering_is_total() {
        let mut groups = vec![
            AgeGroup::Unset,
            AgeGroup::from_years_months(1, 2).unwrap(),
            AgeGroup::Elapsed { months: 3 },
            AgeGroup::Prenatal,
            AgeGroup::Elapsed { months: 0 },
        ];
        groups.sort();
        let labels: Vec<String> = groups.iter().map(ToString::to_string).collect();
        assert_eq!(
            labels,
            vec!["Prenatal", "0 months", "3 months", "1 years 2 months", "Unset"]
        );
    }

    #[test]
    fn test_labels_parse_back() {
        for group in [
            AgeGroup::Prenatal,
            AgeGroup::Unset,
            AgeGroup::Elapsed { months: 0 },
            AgeGroup::Elapsed { months: 11 },
            AgeGroup::Elapsed { months: 25 },
        ] {
            assert_eq!(group.to_string().parse::<AgeGroup>(), Ok(group));
        }
        assert!("0 years 3 months".parse::<AgeGroup>().is_err());
        assert!("14 months".parse::<AgeGroup>().is_err());
        assert!("soon".parse::<AgeGroup>().is_err());
    }

    #[test]
    fn test_oversized_year_label_is_rejected() {
        // 400000000 * 12 does not fit in a u32
        assert_eq!(
            "400000000 years 1 months".parse::<AgeGroup>(),
            Err(ParseAgeGroupError("400000000 years 1 months".to_string()))
        );
        assert_eq!(AgeGroup::from_years_months(u32::MAX / 12, 11), None);
        assert_eq!(
            "357913941 years 3 months".parse::<AgeGroup>(),
            Ok(AgeGroup::Elapsed { months: u32::MAX })
        );
    }

    #[test]
    fn test_grouped_collection_orders_groups_and_members() {
        let files = vec![
            file("/c.jpg", 300, AgeGroup::Elapsed { months: 2 }),
            file("/b.jpg", 200, AgeGroup::Prenatal),
            file("/a.jpg", 100, AgeGroup::Elapsed { months: 2 }),
            file("/d.jpg", 50, AgeGroup::Unset),
        ];
        let grouped = GroupedCollection::from_files(&files);

        assert_eq!(
            grouped.labels(),
            vec![AgeGroup::Prenatal, AgeGroup::Elapsed { months: 2 }, AgeGroup::Unset]
        );
        let names: Vec<&str> = grouped
            .get(&AgeGroup::Elapsed { months: 2 })
            .iter()
            .map(|f| f.name.as_str())
            .collect();
        assert_eq!(names, vec!["a.jpg", "c.jpg"]);
        assert_eq!(grouped.file_count(), 4);
        assert!(grouped.get(&AgeGroup::Elapsed { months: 7 }).is_empty());
    }

    #[test]
    fn test_grouped_collection_serializes_labels_as_keys() {
        let files = vec![file("/a.jpg", 100, AgeGroup::Elapsed { months: 14 })];
        let json = serde_json::to_value(GroupedCollection::from_files(&files)).unwrap();
        assert!(json.get("1 years 2 months").is_some());
    }
}
