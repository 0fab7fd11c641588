//! File-backed log devices.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::device::SyncStorageDevice;

/// A single file addressed by byte offset.
///
/// The file handle is mutex-guarded; each operation seeks then transfers.
/// Offsets in the log's address space map 1:1 to file offsets, so the file
/// is sparse wherever pages are smaller than the address space's page
/// stride.
pub struct FileDevice {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileDevice {
    /// Open (or create) the file at `path`.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Reserve `len` bytes of backing storage up front.
    pub fn preallocate(&self, len: u64) -> io::Result<()> {
        self.file.lock().set_len(len)
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SyncStorageDevice for FileDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        // Reads past the written extent come back zeroed, matching sparse
        // file semantics for unflushed gaps.
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..])? {
                0 => {
                    buf[filled..].fill(0);
                    return Ok(buf.len());
                }
                n => filled += n,
            }
        }
        Ok(filled)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush_all(&self) -> io::Result<()> {
        self.file.lock().sync_all()
    }

    fn truncate_below_sync(&self, _offset: u64) -> io::Result<()> {
        // A flat file cannot release its head portably; the space is left
        // in place and the log's begin address fences it off logically.
        Ok(())
    }

    fn preallocate_sync(&self, len: u64) -> io::Result<()> {
        self.preallocate(len)
    }

    fn byte_size(&self) -> io::Result<u64> {
        self.file.lock().metadata().map(|m| m.len())
    }
}

/// A device split across fixed-size `hlog.<n>` segment files.
///
/// Segment `n` covers offsets `[n * segment_size, (n+1) * segment_size)`.
/// Truncation from below drops whole segment files, which is how the log's
/// begin-address shift reclaims device space.
pub struct SegmentedFileDevice {
    base_dir: PathBuf,
    segment_size: u64,
    segments: Mutex<Vec<Option<FileDevice>>>,
}

impl SegmentedFileDevice {
    const PREFIX: &'static str = "hlog";

    /// Create a segmented device under `base_dir` with `segment_size`-byte
    /// segments (power of two).
    pub fn open(base_dir: impl AsRef<Path>, segment_size: u64) -> io::Result<Self> {
        debug_assert!(crate::utility::is_power_of_two(segment_size));
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir,
            segment_size,
            segments: Mutex::new(Vec::new()),
        })
    }

    fn segment_path(&self, segment: u64) -> PathBuf {
        self.base_dir.join(format!("{}.{segment}", Self::PREFIX))
    }

    /// Run `f` against the segment holding `offset`, opening it on demand.
    fn with_segment<T>(
        &self,
        offset: u64,
        f: impl FnOnce(&FileDevice, u64) -> io::Result<T>,
    ) -> io::Result<T> {
        let segment = offset / self.segment_size;
        let within = offset % self.segment_size;

        let mut segments = self.segments.lock();
        if segments.len() <= segment as usize {
            segments.resize_with(segment as usize + 1, || None);
        }
        if segments[segment as usize].is_none() {
            segments[segment as usize] = Some(FileDevice::open(self.segment_path(segment))?);
        }
        f(segments[segment as usize].as_ref().expect("segment open"), within)
    }
}

impl SyncStorageDevice for SegmentedFileDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        debug_assert!(
            offset % self.segment_size + buf.len() as u64 <= self.segment_size,
            "transfer crosses a segment boundary"
        );
        self.with_segment(offset, |seg, within| seg.read_at(within, buf))
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        debug_assert!(
            offset % self.segment_size + buf.len() as u64 <= self.segment_size,
            "transfer crosses a segment boundary"
        );
        self.with_segment(offset, |seg, within| seg.write_at(within, buf))
    }

    fn flush_all(&self) -> io::Result<()> {
        let segments = self.segments.lock();
        for seg in segments.iter().flatten() {
            seg.flush_all()?;
        }
        Ok(())
    }

    fn truncate_below_sync(&self, offset: u64) -> io::Result<()> {
        // Drop whole segments strictly below `offset`'s segment.
        let keep_from = offset / self.segment_size;
        let mut segments = self.segments.lock();
        for (i, slot) in segments.iter_mut().enumerate() {
            if (i as u64) < keep_from {
                if let Some(seg) = slot.take() {
                    let path = seg.path().to_path_buf();
                    drop(seg);
                    std::fs::remove_file(path).ok();
                }
            }
        }
        Ok(())
    }

    fn byte_size(&self) -> io::Result<u64> {
        let segments = self.segments.lock();
        let mut total = 0;
        for seg in segments.iter().flatten() {
            total += seg.byte_size()?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_device_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let dev = FileDevice::open(dir.path().join("log.dat")).unwrap();

        dev.write_at(4096, b"hybrid log bytes").unwrap();
        let mut buf = [0u8; 16];
        dev.read_at(4096, &mut buf).unwrap();
        assert_eq!(&buf, b"hybrid log bytes");
    }

    #[test]
    fn file_device_reads_past_extent_are_zero() {
        let dir = tempfile::tempdir().unwrap();
        let dev = FileDevice::open(dir.path().join("log.dat")).unwrap();
        dev.write_at(0, b"x").unwrap();

        let mut buf = [0xffu8; 8];
        assert_eq!(dev.read_at(100, &mut buf).unwrap(), 8);
        assert_eq!(buf, [0; 8]);
    }

    #[test]
    fn segmented_device_places_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let dev = SegmentedFileDevice::open(dir.path(), 1 << 16).unwrap();

        dev.write_at(10, b"first").unwrap();
        dev.write_at((1 << 16) + 10, b"second").unwrap();

        assert!(dir.path().join("hlog.0").exists());
        assert!(dir.path().join("hlog.1").exists());

        let mut buf = [0u8; 6];
        dev.read_at((1 << 16) + 10, &mut buf).unwrap();
        assert_eq!(&buf, b"second");
    }

    #[test]
    fn segmented_truncate_drops_low_segments() {
        let dir = tempfile::tempdir().unwrap();
        let dev = SegmentedFileDevice::open(dir.path(), 1 << 16).unwrap();
        dev.write_at(0, b"old").unwrap();
        dev.write_at(1 << 16, b"new").unwrap();

        dev.truncate_below_sync(1 << 16).unwrap();
        assert!(!dir.path().join("hlog.0").exists());
        assert!(dir.path().join("hlog.1").exists());
    }
}
