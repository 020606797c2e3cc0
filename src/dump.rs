//! Bounded rotating capture of raw bus bytes.
//!
//! Purely observational: the daemon tees every byte it reads from or
//! writes to the transport into this file for offline diagnostics. When
//! the file reaches its size bound it is rotated once to `<path>.old`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;

#[derive(Debug)]
pub struct DumpFile {
    path: PathBuf,
    file: File,
    written: u64,
    max_bytes: u64,
}

impl DumpFile {
    pub fn create(path: impl Into<PathBuf>, max_kb: u64) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            file,
            written,
            max_bytes: max_kb * 1024,
        })
    }

    /// Appends observed bytes, rotating first if the bound is reached.
    pub fn record(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.written + bytes.len() as u64 > self.max_bytes {
            self.rotate()?;
        }
        self.file.write_all(bytes)?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        let old = self.path.with_extension("old");
        fs::rename(&self.path, &old)?;
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_at_size_bound() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bus.bin");
        let mut dump = DumpFile::create(&path, 1).unwrap();

        dump.record(&[0xAA; 1000]).unwrap();
        // Second write would exceed 1 kB and must rotate first
        dump.record(&[0xBB; 100]).unwrap();
        dump.record(&[0xCC; 100]).unwrap();

        let old = path.with_extension("old");
        assert_eq!(fs::metadata(&old).unwrap().len(), 1000);
        assert_eq!(fs::metadata(&path).unwrap().len(), 200);
    }
}
