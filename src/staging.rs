use crate::models::WorkItem;
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

/// Local disk buffer between the remote endpoint and the processor: an inbox
/// of freshly downloaded items and an outbox of enriched results.

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("i/o failure for `{name}`: {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("`{name}` is not a valid work item: {source}")]
    MalformedItem {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Create `dir` if absent. Idempotent.
pub fn ensure(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)
}

/// Regular files directly inside `dir`, sorted by name. Subdirectories are
/// not descended into.
pub fn list_files(dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

pub fn read_json(dir: &Path, name: &str) -> Result<WorkItem, StagingError> {
    let raw = fs::read_to_string(dir.join(name)).map_err(|source| StagingError::Io {
        name: name.to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| StagingError::MalformedItem {
        name: name.to_string(),
        source,
    })
}

/// Serialize `item` into `dir/name`, creating parent directories as needed.
/// Output is pretty-printed with struct-declaration field order so result
/// files diff cleanly against their inputs.
///
/// The content is staged under a temporary name and renamed into place, so
/// `dir/name` either holds a complete result or does not exist. An aborted
/// write can strand a `.tmp` file, which the `.json` upload filter ignores.
pub fn write_json(dir: &Path, name: &str, item: &WorkItem) -> Result<(), StagingError> {
    ensure(dir).map_err(|source| StagingError::Io {
        name: name.to_string(),
        source,
    })?;
    let mut rendered =
        serde_json::to_string_pretty(item).map_err(|source| StagingError::MalformedItem {
            name: name.to_string(),
            source,
        })?;
    rendered.push('\n');
    let staged = dir.join(format!("{name}.tmp"));
    fs::write(&staged, rendered).map_err(|source| StagingError::Io {
        name: name.to_string(),
        source,
    })?;
    fs::rename(&staged, dir.join(name)).map_err(|source| {
        let _ = fs::remove_file(&staged);
        StagingError::Io {
            name: name.to_string(),
            source,
        }
    })
}

/// Delete every regular file directly inside `dir`. Files that cannot be
/// removed are logged and left in place; never fatal to the cycle.
pub fn purge(dir: &Path) {
    info!(target: "attrib.staging", dir = %dir.display(), "purging staging directory");
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            info!(target: "attrib.staging", dir = %dir.display(), error = %err, "directory not readable, nothing to purge");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        match entry.file_type() {
            Ok(file_type) if file_type.is_file() => match fs::remove_file(&path) {
                Ok(()) => info!(target: "attrib.staging", file = %path.display(), "deleted"),
                Err(err) => {
                    warn!(target: "attrib.staging", file = %path.display(), error = %err, "could not delete, leaving in place")
                }
            },
            _ => {}
        }
    }
}
