use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use cross_cloud_types::Item;

const FILE_NAME_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

/// One table's slice of a backup artifact. The artifact itself is a
/// compact UTF-8 JSON array of these, and the wire shape is stable:
/// `{"table_name":…,"key_name":…,"items":[…]}` with the key attribute of
/// every item rendered as a JSON string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableBackup {
    pub table_name: String,
    pub key_name: String,
    pub items: Vec<Item>,
}

/// An opaque handle to one backup artifact: the artifact's file name
/// with the configured root path stripped. Immutable once issued.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackupCursor {
    file_name: String,
}

impl BackupCursor {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// timestamp parses the artifact's UTC timestamp back out of the
    /// file name.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let stem = self.file_name.strip_suffix(".json")?;
        NaiveDateTime::parse_from_str(stem, FILE_NAME_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }
}

impl std::fmt::Display for BackupCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.file_name)
    }
}

/// timestamp_file_name renders the artifact file name for a backup taken
/// at `at`: second-resolution UTC, `.json` suffix.
pub(crate) fn timestamp_file_name(at: DateTime<Utc>) -> String {
    format!("{}.json", at.format(FILE_NAME_FORMAT))
}

/// normalize_root_path keeps an empty root empty and gives a non-empty
/// root exactly one trailing slash.
pub(crate) fn normalize_root_path(root_path: &str) -> String {
    if root_path.is_empty() {
        String::new()
    } else if root_path.ends_with('/') {
        root_path.to_string()
    } else {
        format!("{root_path}/")
    }
}
