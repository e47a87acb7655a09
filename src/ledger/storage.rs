use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use super::{LedgerState, schema};
use crate::errors::LedgerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Access {
    Read,
    Write,
}

/// Backing store for the ledger document.
///
/// Every transaction loads the whole document, applies the closure, and (for
/// writes) replaces the whole document. The in-memory variant goes through the
/// same serialization so tests exercise the persisted format.
#[derive(Debug)]
pub(crate) enum Storage {
    File { path: PathBuf },
    Memory { contents: Option<String> },
}

impl Storage {
    pub(crate) fn transact<R, E, F>(&mut self, access: Access, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut LedgerState) -> Result<R, E>,
        E: From<LedgerError>,
    {
        // Held for the whole load/apply/save cycle; released when dropped.
        let _lock = self.lock()?;
        let mut state = self.load()?;
        let result = f(&mut state)?;
        if access == Access::Write {
            self.save(&state)?;
        }
        Ok(result)
    }

    fn lock(&self) -> Result<Option<File>, LedgerError> {
        let Self::File { path } = self else {
            return Ok(None);
        };
        ensure_parent(path)?;
        let lock_path = path.with_extension("lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|source| io_error(&lock_path, source))?;
        file.lock_exclusive()
            .map_err(|source| io_error(&lock_path, source))?;
        Ok(Some(file))
    }

    fn load(&self) -> Result<LedgerState, LedgerError> {
        match self {
            Self::File { path } => {
                if !path.exists() {
                    return Ok(LedgerState::default());
                }
                let text = fs::read_to_string(path).map_err(|source| io_error(path, source))?;
                schema::deserialize(&text)
            }
            Self::Memory { contents } => match contents {
                Some(text) => schema::deserialize(text),
                None => Ok(LedgerState::default()),
            },
        }
    }

    fn save(&mut self, state: &LedgerState) -> Result<(), LedgerError> {
        let text = schema::serialize(state)?;
        match self {
            Self::File { path } => write_atomically(path, &text),
            Self::Memory { contents } => {
                *contents = Some(text);
                Ok(())
            }
        }
    }
}

/// Write to a sibling temp file, fsync, then rename over the target so a
/// reader never observes a partially written ledger.
fn write_atomically(path: &Path, text: &str) -> Result<(), LedgerError> {
    ensure_parent(path)?;
    let tmp_path = path.with_extension("json.tmp");
    let mut tmp = File::create(&tmp_path).map_err(|source| io_error(&tmp_path, source))?;
    tmp.write_all(text.as_bytes())
        .map_err(|source| io_error(&tmp_path, source))?;
    tmp.sync_all().map_err(|source| io_error(&tmp_path, source))?;
    drop(tmp);
    fs::rename(&tmp_path, path).map_err(|source| io_error(path, source))
}

fn ensure_parent(path: &Path) -> Result<(), LedgerError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent).map_err(|source| io_error(parent, source))
        }
        _ => Ok(()),
    }
}

fn io_error(path: &Path, source: std::io::Error) -> LedgerError {
    LedgerError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_loads_empty_state() {
        let dir = TempDir::new().unwrap();
        let mut storage = Storage::File {
            path: dir.path().join("state.json"),
        };
        let count = storage
            .transact(Access::Read, |state| Ok::<_, LedgerError>(state.executions.len()))
            .unwrap();
        assert_eq!(count, 0);
        assert!(!dir.path().join("state.json").exists());
    }

    #[test]
    fn test_write_creates_parent_dirs_and_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let mut storage = Storage::File { path: path.clone() };
        storage
            .transact(Access::Write, |_| Ok::<_, LedgerError>(()))
            .unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"version\": 1"));
    }

    #[test]
    fn test_failed_closure_does_not_persist() {
        let mut storage = Storage::Memory { contents: None };
        let result: Result<(), LedgerError> = storage.transact(Access::Write, |_| {
            Err(LedgerError::QueueEntryNotFound { id: 9 })
        });
        assert!(result.is_err());
        assert!(matches!(storage, Storage::Memory { contents: None }));
    }

    #[test]
    fn test_corrupt_file_surfaces_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{ not json").unwrap();
        let mut storage = Storage::File { path };
        let result = storage.transact(Access::Read, |_| Ok::<_, LedgerError>(()));
        assert!(matches!(result, Err(LedgerError::Serialize(_))));
    }
}
