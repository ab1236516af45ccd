//! Side-channel text file rendered on screen by the encoder.
//!
//! The encoder re-reads the file periodically, so every write goes to a
//! sibling temp file first and is renamed into place; a reader never sees a
//! half-written file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Sink for the on-screen overlay text.
pub trait OverlayChannel: Send {
    fn update(&self, text: &str) -> io::Result<()>;
    fn clear(&self) -> io::Result<()>;
}

/// [`OverlayChannel`] backed by a plain text file.
#[derive(Debug, Clone)]
pub struct FileOverlay {
    path: PathBuf,
}

/// Temp path used while writing: `<name>.tmp` next to the target.
pub fn staging_path(path: &Path) -> PathBuf {
    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    PathBuf::from(staging)
}

impl FileOverlay {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_atomic(&self, contents: &str) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let staging = staging_path(&self.path);
        fs::write(&staging, contents)?;
        if let Err(e) = fs::rename(&staging, &self.path) {
            let _ = fs::remove_file(&staging);
            return Err(e);
        }
        Ok(())
    }
}

impl OverlayChannel for FileOverlay {
    fn update(&self, text: &str) -> io::Result<()> {
        // a newline would render as a glyph box in the overlay
        let single_line = text.lines().map(str::trim).collect::<Vec<_>>().join(" ");
        self.write_atomic(&single_line)
    }

    fn clear(&self) -> io::Result<()> {
        self.write_atomic("")
    }
}
