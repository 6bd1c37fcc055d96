//! JSON checkpoint file with exclusive ownership of its directory

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::core::{Error, Result};
use crate::engine::state::AccountState;
use crate::storage::CheckpointStore;

const CHECKPOINT_FILE: &str = "checkpoint.json";
const LOCK_FILE: &str = "checkpoint.lock";

/// File-backed checkpoint store.
///
/// Opening creates a lock file that is removed on drop; a second engine
/// pointed at the same directory fails to open instead of racing the first.
/// Writes go to a temp file and are renamed into place.
#[derive(Debug)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    lock_path: PathBuf,
}

impl FileCheckpointStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let lock_path = dir.join(LOCK_FILE);
        let mut lock = match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::Persistence(format!(
                    "{} is locked by another process (remove {} if stale)",
                    dir.display(),
                    lock_path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        writeln!(lock, "{}", std::process::id())?;

        info!("Checkpoint store opened at {}", dir.display());
        Ok(Self { dir, lock_path })
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_FILE)
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&self, state: &AccountState) -> Result<()> {
        let payload = serde_json::to_vec_pretty(state)?;
        let tmp = self.dir.join(format!("{}.tmp", CHECKPOINT_FILE));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&payload)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, self.path())?;
        debug!("Checkpoint v{} written", state.version);
        Ok(())
    }

    fn load(&self) -> Result<Option<AccountState>> {
        let content = match fs::read(self.path()) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state = serde_json::from_slice(&content)
            .map_err(|e| Error::Persistence(format!("corrupt checkpoint: {}", e)))?;
        Ok(Some(state))
    }
}

impl Drop for FileCheckpointStore {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.lock_path) {
            warn!("Failed to release checkpoint lock {}: {}", self.lock_path.display(), e);
        }
    }
}
