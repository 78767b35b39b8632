//! Atomic file-backed blob persistence, shared by every coordinator subsystem
//! that owns an on-disk JSON document (target config, agent registry, results
//! store). Writes never leave a torn file on disk: the new content lands in
//! a sibling `.tmp` file, is fsynced, then renamed over the target path.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{MonitoringError, Result};

/// Reads and deserializes `path`, returning `Ok(None)` if it does not exist.
/// A malformed file is a `ValidationFailure`, distinguishing "absent" (fine,
/// caller supplies a default) from "present but corrupt" (caller should keep
/// whatever it already has in memory and log a warning).
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(MonitoringError::IoFailure(format!(
                "reading {}: {e}",
                path.display()
            ))
            .into())
        }
    };
    let value = serde_json::from_slice(&bytes).map_err(|e| {
        MonitoringError::ValidationFailure(format!("parsing {}: {e}", path.display()))
    })?;
    Ok(Some(value))
}

/// Serializes `value` as pretty-printed JSON and atomically replaces `path`:
/// write to `path.tmp`, fsync, rename. Creates the parent directory if absent.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            MonitoringError::IoFailure(format!(
                "creating directory {}: {e}",
                parent.display()
            ))
        })?;
    }

    let tmp_path = path.with_extension(match path.extension() {
        Some(ext) => format!("{}.tmp", ext.to_string_lossy()),
        None => "tmp".to_string(),
    });

    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| MonitoringError::IoFailure(format!("serializing {}: {e}", path.display())))?;

    {
        let file = std::fs::File::create(&tmp_path).map_err(|e| {
            MonitoringError::IoFailure(format!("creating {}: {e}", tmp_path.display()))
        })?;
        use std::io::Write;
        let mut file = file;
        file.write_all(&json).map_err(|e| {
            MonitoringError::IoFailure(format!("writing {}: {e}", tmp_path.display()))
        })?;
        file.sync_all().map_err(|e| {
            MonitoringError::IoFailure(format!("fsyncing {}: {e}", tmp_path.display()))
        })?;
    }

    std::fs::rename(&tmp_path, path).map_err(|e| {
        MonitoringError::IoFailure(format!(
            "renaming {} to {}: {e}",
            tmp_path.display(),
            path.display()
        ))
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        value: u32,
    }

    #[test]
    fn round_trips_through_atomic_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sample.json");

        assert!(read_json::<Sample>(&path).unwrap().is_none());

        write_json_atomic(&path, &Sample { value: 7 }).unwrap();
        let loaded: Sample = read_json(&path).unwrap().unwrap();
        assert_eq!(loaded, Sample { value: 7 });

        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn corrupt_file_is_a_validation_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.json");
        std::fs::write(&path, b"not json").unwrap();
        assert!(read_json::<Sample>(&path).is_err());
    }
}
