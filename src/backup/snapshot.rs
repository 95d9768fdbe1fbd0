// Snapshot file naming: backup_<YYYYMMDD_HHMMSS>.dump
use crate::errors::{AppError, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use std::sync::LazyLock;

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

static SNAPSHOT_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^backup_(\d{8}_\d{6})\.dump$").expect("snapshot name pattern is valid")
});

/// The timestamp is UTC. Two snapshots started within the same second share
/// a name; the second overwrites the first.
pub fn snapshot_name(at: DateTime<Utc>) -> String {
    format!("backup_{}.dump", at.format(TIMESTAMP_FORMAT))
}

/// Timestamp encoded in a snapshot name, if it follows the naming scheme.
pub fn snapshot_time(name: &str) -> Option<DateTime<Utc>> {
    let captures = SNAPSHOT_NAME.captures(name)?;
    NaiveDateTime::parse_from_str(&captures[1], TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Rejects anything that is not a plain file name.
pub fn validate_file_name(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0');
    if invalid {
        return Err(AppError::Validation(format!("Invalid backup file name: {:?}", name)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_snapshot_name_format() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 4, 5, 6).unwrap();
        let name = snapshot_name(at);
        assert_eq!(name, "backup_20240309_040506.dump");
        assert_eq!(snapshot_time(&name), Some(at));
    }

    #[test]
    fn test_snapshot_name_is_utc_whatever_the_offset() {
        let plus_two = chrono::FixedOffset::east_opt(2 * 3600).unwrap();
        let at = plus_two.with_ymd_and_hms(2024, 3, 9, 6, 5, 6).unwrap();
        assert_eq!(snapshot_name(at.with_timezone(&Utc)), "backup_20240309_040506.dump");
    }

    #[test]
    fn test_foreign_names_have_no_timestamp() {
        assert_eq!(snapshot_time("notes.txt"), None);
        assert_eq!(snapshot_time("backup_2024_0309.dump"), None);
        assert_eq!(snapshot_time("backup_20241399_000000.dump"), None);
    }

    #[test]
    fn test_validate_file_name() {
        assert!(validate_file_name("backup_20240309_040506.dump").is_ok());
        assert!(validate_file_name("anything.sql").is_ok());
        for bad in ["", ".", "..", "../etc/passwd", "a/b.dump", "a\\b.dump"] {
            assert!(matches!(validate_file_name(bad), Err(AppError::Validation(_))), "{:?}", bad);
        }
    }
}
