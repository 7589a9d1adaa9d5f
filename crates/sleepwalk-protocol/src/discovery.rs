//! Filesystem discoveries produced during traversal.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether a discovery is a file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryKind {
    File,
    Directory,
}

impl DiscoveryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Directory => "directory",
        }
    }
}

/// Metadata for one filesystem entry met during a walk.
///
/// `path` is always canonical and contained in the session's allowed roots;
/// the explorer proves this before building the value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discovery {
    pub path: PathBuf,
    pub name: String,
    pub kind: DiscoveryKind,
    /// Size in bytes. Always zero for directories.
    pub size_bytes: u64,
    pub modified_at: DateTime<Utc>,
    /// Leading bytes of a text file, decoded as UTF-8. Never set for directories.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
}

impl Discovery {
    pub fn file(
        path: impl Into<PathBuf>,
        size_bytes: u64,
        modified_at: DateTime<Utc>,
        preview: Option<String>,
    ) -> Self {
        let path = path.into();
        Self {
            name: file_name(&path),
            path,
            kind: DiscoveryKind::File,
            size_bytes,
            modified_at,
            preview,
        }
    }

    pub fn directory(path: impl Into<PathBuf>, modified_at: DateTime<Utc>) -> Self {
        let path = path.into();
        Self {
            name: file_name(&path),
            path,
            kind: DiscoveryKind::Directory,
            size_bytes: 0,
            modified_at,
            preview: None,
        }
    }

    pub fn is_file(&self) -> bool {
        self.kind == DiscoveryKind::File
    }

    pub fn is_directory(&self) -> bool {
        self.kind == DiscoveryKind::Directory
    }
}

fn file_name(path: &std::path::Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_discovery_takes_name_from_path() {
        let discovery = Discovery::file(
            "/sandbox/notes.txt",
            10,
            Utc::now(),
            Some("hello".to_owned()),
        );
        assert_eq!(discovery.name, "notes.txt");
        assert!(discovery.is_file());
        assert!(!discovery.is_directory());
    }

    #[test]
    fn directory_discovery_has_no_size_or_preview() {
        let discovery = Discovery::directory("/sandbox/photos", Utc::now());
        assert_eq!(discovery.name, "photos");
        assert_eq!(discovery.size_bytes, 0);
        assert!(discovery.preview.is_none());
        assert_eq!(discovery.kind.as_str(), "directory");
    }

    #[test]
    fn discovery_kind_serializes_snake_case() {
        let json = serde_json::to_string(&DiscoveryKind::Directory).unwrap();
        assert_eq!(json, "\"directory\"");
    }
}
