//! Playlist module: the supply of work items fed to the supervisor.
//!
//! The supervisor only needs [`WorkSource::next`]; [`DirectoryPlaylist`] is
//! the stock implementation that loops over the video files of one directory.

use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Video file extensions picked up by the scanner (case-insensitive matching).
pub const VIDEO_EXTENSIONS: &[&str] = &[
    ".mkv", ".mp4", ".avi", ".mov", ".m4v", ".ts", ".flv", ".webm",
];

/// One input file to stream for the length of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub path: PathBuf,
    pub display_name: String,
}

impl WorkItem {
    pub fn new(path: PathBuf, display_name: impl Into<String>) -> Self {
        Self {
            path,
            display_name: display_name.into(),
        }
    }

    /// Build an item whose display name is derived from the file name.
    pub fn from_path(path: PathBuf) -> Self {
        let display_name = display_name_for(&path);
        Self { path, display_name }
    }
}

/// Source of work items. `None` means nothing is playable right now.
pub trait WorkSource: Send {
    fn next(&mut self) -> Option<WorkItem>;
}

/// Human-readable title for a media file: the file stem with `_` and `.`
/// turned into spaces.
pub fn display_name_for(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = stem
        .replace(['_', '.'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if name.is_empty() {
        path.to_string_lossy().into_owned()
    } else {
        name
    }
}

/// Checks if a file has a video extension (case-insensitive).
pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = format!(".{}", ext.to_lowercase());
            VIDEO_EXTENSIONS.contains(&ext_lower.as_str())
        })
        .unwrap_or(false)
}

/// Scans `dir` for video files, sorted by path.
///
/// Hidden directories (names starting with `.`) are skipped. A missing
/// directory yields an empty list.
pub fn scan_media(dir: &Path, recursive: bool) -> Vec<PathBuf> {
    if !dir.exists() {
        return Vec::new();
    }

    let max_depth = if recursive { usize::MAX } else { 1 };
    let walker = WalkDir::new(dir)
        .max_depth(max_depth)
        .into_iter()
        .filter_entry(|entry| {
            if entry.file_type().is_dir() && entry.depth() > 0 {
                if let Some(name) = entry.file_name().to_str() {
                    return !name.starts_with('.');
                }
            }
            true
        });

    let mut files: Vec<PathBuf> = walker
        .filter_map(|e| e.ok())
        .filter(|entry| entry.file_type().is_file() && is_video_file(entry.path()))
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    files
}

/// Loops over the video files of a directory forever.
///
/// The directory is rescanned every time the list wraps around, so files
/// added or removed while streaming are picked up on the next pass. The
/// position advances on every call regardless of how the previous item fared.
#[derive(Debug)]
pub struct DirectoryPlaylist {
    dir: PathBuf,
    recursive: bool,
    items: Vec<PathBuf>,
    position: usize,
}

impl DirectoryPlaylist {
    pub fn new(dir: PathBuf, recursive: bool) -> Self {
        Self {
            dir,
            recursive,
            items: Vec::new(),
            position: 0,
        }
    }

    fn rescan(&mut self) {
        self.items = scan_media(&self.dir, self.recursive);
        self.position = 0;
        info!(
            dir = %self.dir.display(),
            files = self.items.len(),
            "playlist scanned"
        );
    }
}

impl WorkSource for DirectoryPlaylist {
    fn next(&mut self) -> Option<WorkItem> {
        let mut rescanned = false;
        loop {
            if self.position >= self.items.len() {
                if rescanned {
                    return None;
                }
                self.rescan();
                rescanned = true;
                continue;
            }

            let path = self.items[self.position].clone();
            self.position += 1;
            if path.is_file() {
                return Some(WorkItem::from_path(path));
            }
            debug!(path = %path.display(), "playlist entry vanished; skipping");
        }
    }
}
