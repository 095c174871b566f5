//! Mount configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use xd_dir::MAX_INO;
use xd_error::{DirError, Result};
use xd_ondisk::DirFeatures;
use xd_ondisk::geometry::{MAX_DIR_BLOCK_LOG, MIN_FS_BLOCK_LOG};
use xd_types::FsUuid;

/// Default number of resident buffers.
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

/// Everything a mount needs to know about the filesystem it serves.
///
/// Missing JSON fields take their defaults, so `{}` describes a 4 KiB
/// filesystem with file types in entries and no CRCs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// log2 of the filesystem block size.
    pub fs_block_log: u8,
    /// log2 of filesystem blocks per directory block.
    pub dir_block_log: u8,
    /// v3 self-describing metadata with CRC32c.
    pub crc: bool,
    /// File type byte in directory entries.
    pub ftype: bool,
    /// ASCII case-insensitive name lookup.
    pub ascii_ci: bool,
    pub meta_uuid: FsUuid,
    /// Largest inode number an entry may carry.
    pub max_inode: u64,
    pub cache_capacity: usize,
    /// Log cycle the journal head starts in. Block LSNs stamped by an
    /// earlier mount must come from a smaller cycle.
    pub log_cycle: u32,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            fs_block_log: 12,
            dir_block_log: 0,
            crc: false,
            ftype: true,
            ascii_ci: false,
            meta_uuid: FsUuid::NIL,
            max_inode: MAX_INO,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            log_cycle: 1,
        }
    }
}

impl MountConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|err| DirError::Parse(format!("mount config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|err| DirError::Parse(err.to_string()))
    }

    /// Reject configurations no mount can serve.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_FS_BLOCK_LOG..=MAX_DIR_BLOCK_LOG).contains(&self.fs_block_log) {
            return Err(DirError::InvalidGeometry(format!(
                "fs_block_log={} (must be in {MIN_FS_BLOCK_LOG}..={MAX_DIR_BLOCK_LOG})",
                self.fs_block_log
            )));
        }
        if u32::from(self.fs_block_log) + u32::from(self.dir_block_log) > u32::from(MAX_DIR_BLOCK_LOG) {
            return Err(DirError::InvalidGeometry(format!(
                "directory block too large: fs_block_log={} dir_block_log={}",
                self.fs_block_log, self.dir_block_log
            )));
        }
        if self.crc && !self.ftype {
            return Err(DirError::Format("crc requires ftype".to_owned()));
        }
        if self.max_inode == 0 {
            return Err(DirError::Format("max_inode must be > 0".to_owned()));
        }
        if self.cache_capacity == 0 {
            return Err(DirError::Format("cache_capacity must be > 0".to_owned()));
        }
        Ok(())
    }

    #[must_use]
    pub fn features(&self) -> DirFeatures {
        DirFeatures {
            crc: self.crc,
            ftype: self.ftype,
        }
    }

    #[must_use]
    pub fn fs_block_size(&self) -> u32 {
        1_u32 << self.fs_block_log
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_takes_defaults() {
        let config = MountConfig::from_json_str("{}").unwrap();
        assert_eq!(config, MountConfig::default());
        assert_eq!(config.fs_block_size(), 4096);
        assert_eq!(
            config.features(),
            DirFeatures {
                crc: false,
                ftype: true
            }
        );
    }

    #[test]
    fn json_round_trip() {
        let config = MountConfig {
            fs_block_log: 10,
            dir_block_log: 2,
            crc: true,
            ascii_ci: true,
            meta_uuid: FsUuid::from_u128(0x1234),
            log_cycle: 9,
            ..MountConfig::default()
        };
        let json = config.to_json_pretty().unwrap();
        assert_eq!(MountConfig::from_json_str(&json).unwrap(), config);
    }

    #[test]
    fn validation_rejects_bad_geometry_and_features() {
        let cases = [
            (r#"{"fs_block_log": 8}"#, "InvalidGeometry"),
            (r#"{"fs_block_log": 17}"#, "InvalidGeometry"),
            (r#"{"fs_block_log": 14, "dir_block_log": 3}"#, "InvalidGeometry"),
            (r#"{"crc": true, "ftype": false}"#, "Format"),
            (r#"{"cache_capacity": 0}"#, "Format"),
            (r#"{"max_inode": 0}"#, "Format"),
            (r#"{"fs_block_log": "big"}"#, "Parse"),
        ];
        for (json, kind) in cases {
            let err = MountConfig::from_json_str(json).unwrap_err();
            let got = match err {
                DirError::InvalidGeometry(_) => "InvalidGeometry",
                DirError::Format(_) => "Format",
                DirError::Parse(_) => "Parse",
                other => panic!("unexpected error for {json}: {other:?}"),
            };
            assert_eq!(got, kind, "{json}");
        }
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mount.json");
        std::fs::write(&path, r#"{"crc": true, "log_cycle": 4}"#).unwrap();
        let config = MountConfig::from_json_file(&path).unwrap();
        assert!(config.crc);
        assert_eq!(config.log_cycle, 4);
        assert!(matches!(
            MountConfig::from_json_file(dir.path().join("missing.json")),
            Err(DirError::Io(_))
        ));
    }
}
