//! Atomic JSON persistence.
//!
//! Every file a concurrent reader may observe (status, ledger, process
//! registry, request/response channels) is written via temp-file-and-
//! rename so readers never see a torn document.

use std::path::Path;

use serde::Serialize;

use crate::error::{KernelError, KernelResult};

/// Serialize `value` as pretty JSON and atomically replace `path`.
pub(crate) fn write_json_atomically<T: Serialize>(path: &Path, value: &T) -> KernelResult<()> {
    let state_err = |source| KernelError::StateIo {
        path: path.display().to_string(),
        source,
    };
    let rendered =
        serde_json::to_vec_pretty(value).map_err(|e| state_err(std::io::Error::other(e)))?;
    let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
    std::fs::write(&tmp, rendered).map_err(state_err)?;
    std::fs::rename(&tmp, path).map_err(state_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_replaces_existing_content() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.json");
        write_json_atomically(&path, &serde_json::json!({ "v": 1 })).unwrap();
        write_json_atomically(&path, &serde_json::json!({ "v": 2 })).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["v"], 2);
        // No temp file left behind.
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 1);
    }
}
