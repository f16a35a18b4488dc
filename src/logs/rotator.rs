//! Size-based log rotation
//!
//! Rotation shifts `path.i` to `path.i+1` for the configured number of kept
//! slots, moves the live file to `path.1`, and optionally gzips it. Missing
//! intermediate slots are tolerated; the overflow slot `path.<keep+1>` never
//! survives a rotation.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::debug;

/// Rotation policy for one log file
#[derive(Debug, Clone)]
pub struct LogRotator {
    max_size: u64,
    keep: usize,
    compress: bool,
}

impl LogRotator {
    /// Create a rotator. `keep` is clamped to at least one slot.
    pub fn new(max_size: u64, keep: usize, compress: bool) -> Self {
        Self {
            max_size,
            keep: keep.max(1),
            compress,
        }
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Rotate `path` when it has reached the size threshold.
    ///
    /// Returns `Ok(true)` when a rotation happened. A file that cannot be
    /// stat'ed (typically: not created yet) is not an error.
    pub fn rotate_if_needed(&self, path: &Path) -> io::Result<bool> {
        let size = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(false),
        };
        if size < self.max_size {
            return Ok(false);
        }

        debug!("Rotating {} ({} bytes)", path.display(), size);

        // Drop the overflow slot so the shift below never leaves keep+1 behind
        let _ = fs::remove_file(self.slot(path, self.keep + 1));

        // Shift keep-1 .. 1 upward; holes are fine
        for i in (1..self.keep).rev() {
            let from = self.slot(path, i);
            let to = self.slot(path, i + 1);
            match fs::rename(&from, &to) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }

        let first = path_with_suffix(path, 1, false);
        fs::rename(path, &first)?;

        if self.compress {
            self.gzip_in_place(&first)?;
        }

        Ok(true)
    }

    /// Slot path as it exists on disk for this policy (`.gz` when compressing)
    fn slot(&self, path: &Path, index: usize) -> PathBuf {
        path_with_suffix(path, index, self.compress)
    }

    /// Compress `path` into `path.gz` and remove the uncompressed file. On
    /// failure the uncompressed file is left in place and the error
    /// propagates.
    fn gzip_in_place(&self, path: &Path) -> io::Result<()> {
        let gz_path = {
            let mut s = path.as_os_str().to_owned();
            s.push(".gz");
            PathBuf::from(s)
        };

        let mut input = fs::File::open(path)?;
        let output = fs::File::create(&gz_path)?;
        let mut encoder = GzEncoder::new(output, Compression::default());

        if let Err(e) = io::copy(&mut input, &mut encoder) {
            let _ = fs::remove_file(&gz_path);
            return Err(e);
        }
        if let Err(e) = encoder.finish() {
            let _ = fs::remove_file(&gz_path);
            return Err(e);
        }

        fs::remove_file(path)?;
        Ok(())
    }
}

fn path_with_suffix(path: &Path, index: usize, gz: bool) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(format!(".{}", index));
    if gz {
        s.push(".gz");
    }
    PathBuf::from(s)
}
