//! Generation-based state files across multiple data directories.
//!
//! A snapshot is written as `{prefix}{generation}.st` under the `_state`
//! subdirectory of every configured data path. The greatest generation found
//! on any path is authoritative; everything else is garbage the cleanup pass
//! removes.
//!
//! Writers are serialized by the caller (only the elected master writes
//! state). Readers rely on the platform's atomic-rename contract to never
//! observe a half-written final file.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::error::{Result, StateError, WriteStateError};
use crate::format;

/// Subdirectory of each data path holding state files.
pub const STATE_DIR_NAME: &str = "_state";

/// Extension of a finalized state file.
pub const STATE_FILE_EXTENSION: &str = ".st";

/// Suffix of an in-progress write.
const TMP_SUFFIX: &str = ".tmp";

/// Reads and writes checksummed snapshots of a serializable value.
///
/// The type is stateless apart from the file prefix; generation numbering
/// comes from the directories themselves.
#[derive(Debug, Clone)]
pub struct StateFormat<T> {
    prefix: String,
    protocol_version: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> StateFormat<T> {
    /// Create a format writing `{prefix}{generation}.st` files.
    pub fn new(prefix: impl Into<String>, protocol_version: u64) -> Self {
        Self {
            prefix: prefix.into(),
            protocol_version,
            _marker: PhantomData,
        }
    }

    /// The configured file prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Write `state` to every directory, returning the new generation.
    ///
    /// The new file is staged as a tmp file in the first directory, fsynced,
    /// byte-copied to the remaining directories, and only then renamed to its
    /// final name everywhere (first directory first). Failures before the
    /// first rename report `dirty = false`; failures after it report
    /// `dirty = true` since directories may now disagree.
    #[instrument(skip(self, state), fields(prefix = %self.prefix))]
    pub fn write(&self, state: &T, dirs: &[PathBuf]) -> std::result::Result<u64, WriteStateError> {
        if dirs.is_empty() {
            return Err(WriteStateError::clean(StateError::NoDirectories));
        }

        let generation = self
            .max_generation(dirs)
            .map_err(WriteStateError::clean)?
            .map_or(1, |gen| gen + 1);
        let file_name = self.file_name(generation);
        let tmp_name = format!("{file_name}{TMP_SUFFIX}");

        let bytes = format::encode_state_file(state, self.protocol_version)
            .map_err(WriteStateError::clean)?;

        // Stage the tmp file in every directory before any rename.
        for dir in dirs {
            let state_dir = dir.join(STATE_DIR_NAME);
            if let Err(err) = write_tmp_file(&state_dir, &tmp_name, &bytes) {
                self.remove_tmp_files(dirs, &tmp_name);
                return Err(WriteStateError::clean(err));
            }
        }

        // Rename first directory first; from the first success onward a
        // failure leaves the directories inconsistent.
        let mut renamed = 0;
        for dir in dirs {
            let state_dir = dir.join(STATE_DIR_NAME);
            let result = fs::rename(state_dir.join(&tmp_name), state_dir.join(&file_name))
                .map_err(StateError::from)
                .and_then(|()| sync_dir(&state_dir));
            if let Err(err) = result {
                self.remove_tmp_files(dirs, &tmp_name);
                return Err(if renamed > 0 {
                    WriteStateError::dirty(err)
                } else {
                    WriteStateError::clean(err)
                });
            }
            renamed += 1;
        }

        debug!(generation, "wrote state to {} directories", dirs.len());
        Ok(generation)
    }

    /// Write `state` and remove every other generation afterwards.
    pub fn write_and_cleanup(
        &self,
        state: &T,
        dirs: &[PathBuf],
    ) -> std::result::Result<u64, WriteStateError> {
        let generation = self.write(state, dirs)?;
        if let Err(err) = self.cleanup_old_files(generation, dirs) {
            // The new generation is durable; stale files only waste space.
            warn!("cleanup after state write failed: {err}");
        }
        Ok(generation)
    }

    /// Load the state with the greatest generation found on any directory.
    ///
    /// Returns `None` when no directory holds a state file. When a greatest
    /// generation exists, every directory holding it is tried in turn; if
    /// none yields a file that passes checksum and header verification the
    /// error is fatal ([`StateError::Corrupt`]); older generations are never
    /// silently used.
    #[instrument(skip(self), fields(prefix = %self.prefix))]
    pub fn load_latest(&self, dirs: &[PathBuf]) -> Result<Option<(T, u64)>> {
        if dirs.is_empty() {
            return Err(StateError::NoDirectories);
        }

        let Some(generation) = self.max_generation(dirs)? else {
            return Ok(None);
        };

        let file_name = self.file_name(generation);
        let mut last_error: Option<StateError> = None;
        for dir in dirs {
            let path = dir.join(STATE_DIR_NAME).join(&file_name);
            if !path.exists() {
                continue;
            }
            match read_state_file(&path) {
                Ok(state) => {
                    debug!(generation, "loaded state from {}", path.display());
                    return Ok(Some((state, generation)));
                }
                Err(err) => {
                    warn!("failed to read {}: {err}", path.display());
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            StateError::corrupt(file_name, "generation present but no file readable")
        }))
    }

    /// Remove every file with this format's prefix whose generation differs
    /// from `keep_generation`, along with stray tmp files.
    pub fn cleanup_old_files(&self, keep_generation: u64, dirs: &[PathBuf]) -> Result<()> {
        for dir in dirs {
            let state_dir = dir.join(STATE_DIR_NAME);
            if !state_dir.exists() {
                continue;
            }
            for entry in fs::read_dir(&state_dir)? {
                let entry = entry?;
                let name = entry.file_name();
                let name = name.to_string_lossy();
                let stale = if name.ends_with(TMP_SUFFIX) {
                    name.starts_with(&self.prefix)
                } else {
                    matches!(self.generation_of(&name), Some(gen) if gen != keep_generation)
                };
                if stale {
                    debug!("removing stale state file {}", entry.path().display());
                    fs::remove_file(entry.path())?;
                }
            }
        }
        Ok(())
    }

    /// Greatest generation present on any directory, if any.
    fn max_generation(&self, dirs: &[PathBuf]) -> Result<Option<u64>> {
        let mut max = None;
        for dir in dirs {
            let state_dir = dir.join(STATE_DIR_NAME);
            if !state_dir.exists() {
                continue;
            }
            for entry in fs::read_dir(&state_dir)? {
                let entry = entry?;
                if let Some(gen) = self.generation_of(&entry.file_name().to_string_lossy()) {
                    max = Some(max.map_or(gen, |m: u64| m.max(gen)));
                }
            }
        }
        Ok(max)
    }

    fn file_name(&self, generation: u64) -> String {
        format!("{}{generation}{STATE_FILE_EXTENSION}", self.prefix)
    }

    /// Parse the generation out of `{prefix}{generation}.st`.
    fn generation_of(&self, file_name: &str) -> Option<u64> {
        file_name
            .strip_prefix(&self.prefix)?
            .strip_suffix(STATE_FILE_EXTENSION)?
            .parse()
            .ok()
    }

    /// Best-effort removal of staged tmp files after a failed write.
    fn remove_tmp_files(&self, dirs: &[PathBuf], tmp_name: &str) {
        for dir in dirs {
            let path = dir.join(STATE_DIR_NAME).join(tmp_name);
            if path.exists() {
                let _ = fs::remove_file(path);
            }
        }
    }
}

fn write_tmp_file(state_dir: &Path, tmp_name: &str, bytes: &[u8]) -> Result<()> {
    fs::create_dir_all(state_dir)?;
    let path = state_dir.join(tmp_name);
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

fn read_state_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path)?;
    format::decode_state_file(&bytes, &path.display().to_string())
}

/// Fsync a directory so renames within it are durable.
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}
