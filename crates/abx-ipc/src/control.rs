//! Read-only control flags published by the host application.
//!
//! The record is three bytes, one per flag: block ads, block malware, don't
//! track me. This process never creates or writes the file; it re-reads it
//! on every access so a host that appears (or flips a flag) mid-run is
//! picked up by the next read. A missing or short file reads as all-false.

use std::io::Read;
use std::path::PathBuf;

const CONTROL_FILE: &str = "adblock_control";

pub struct ControlFlags {
    path: PathBuf,
}

impl ControlFlags {
    /// Flags at the default location under the system temp directory.
    pub fn new() -> Self {
        Self::at(std::env::temp_dir().join(CONTROL_FILE))
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn block_ads(&self) -> bool {
        self.flag(0)
    }

    pub fn block_malware(&self) -> bool {
        self.flag(1)
    }

    pub fn dont_track_me(&self) -> bool {
        self.flag(2)
    }

    fn flag(&self, index: usize) -> bool {
        let mut record = [0u8; 3];
        match std::fs::File::open(&self.path).and_then(|mut f| f.read_exact(&mut record)) {
            Ok(()) => record[index] != 0,
            Err(_) => false,
        }
    }
}

impl Default for ControlFlags {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_reads_as_all_false() {
        let dir = tempfile::tempdir().unwrap();
        let flags = ControlFlags::at(dir.path().join("absent"));
        assert!(!flags.block_ads());
        assert!(!flags.block_malware());
        assert!(!flags.dont_track_me());
    }

    #[test]
    fn flags_map_to_record_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control");
        std::fs::write(&path, [1u8, 0, 1]).unwrap();
        let flags = ControlFlags::at(&path);
        assert!(flags.block_ads());
        assert!(!flags.block_malware());
        assert!(flags.dont_track_me());
    }

    #[test]
    fn a_file_created_mid_run_is_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control");
        let flags = ControlFlags::at(&path);
        assert!(!flags.block_ads());
        std::fs::write(&path, [1u8, 1, 0]).unwrap();
        assert!(flags.block_ads());
        assert!(flags.block_malware());
        std::fs::write(&path, [0u8, 1, 0]).unwrap();
        assert!(!flags.block_ads());
    }

    #[test]
    fn short_record_reads_as_all_false() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control");
        std::fs::write(&path, [1u8]).unwrap();
        let flags = ControlFlags::at(&path);
        assert!(!flags.block_ads());
    }
}
