//! Atomic file persistence for store collections.
//!
//! Each collection lives in its own `<collection>.json` file under the
//! store's base path. Files are rewritten whole: serialise to a sibling
//! temp file, then rename over the target. No file handle is kept open
//! between operations.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

use super::{Collection, StoreError};

/// Path of a collection file under `base`.
pub fn collection_path(base: &Path, collection: Collection) -> PathBuf {
    base.join(format!("{}.json", collection.as_str()))
}

/// Write a serialisable payload to the collection file atomically.
///
/// # Errors
///
/// Returns [`StoreError::Encode`] when serialisation fails and
/// [`StoreError::Persistence`] on any filesystem failure. The in-memory
/// collection is untouched either way.
pub fn write_atomic<T: Serialize>(
    base: &Path,
    collection: Collection,
    payload: &T,
) -> Result<(), StoreError> {
    let target = collection_path(base, collection);
    let bytes = serde_json::to_vec_pretty(payload).map_err(|source| StoreError::Encode {
        collection: collection.as_str(),
        source,
    })?;

    let tmp = target.with_extension("json.tmp");
    std::fs::write(&tmp, &bytes).map_err(|source| StoreError::Persistence {
        collection: collection.as_str(),
        source,
    })?;
    std::fs::rename(&tmp, &target).map_err(|source| StoreError::Persistence {
        collection: collection.as_str(),
        source,
    })?;

    trace!(collection = collection.as_str(), bytes = bytes.len(), "collection flushed");
    Ok(())
}

/// Load a collection file if present. A missing file is `Ok(None)` — a
/// fresh store simply has no files yet.
///
/// # Errors
///
/// Returns [`StoreError::Decode`] when the file exists but does not parse,
/// and [`StoreError::Persistence`] on read failure.
pub fn load<T: DeserializeOwned>(
    base: &Path,
    collection: Collection,
) -> Result<Option<T>, StoreError> {
    let path = collection_path(base, collection);
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Persistence {
                collection: collection.as_str(),
                source,
            })
        }
    };
    let value = serde_json::from_str(&contents).map_err(|source| StoreError::Decode {
        path: path.display().to_string(),
        source,
    })?;
    Ok(Some(value))
}
