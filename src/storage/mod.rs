//! Storage - Account state checkpoints

pub mod file;

use parking_lot::Mutex;

use crate::core::Result;
use crate::engine::state::AccountState;

pub use file::FileCheckpointStore;

/// Persists the account state so a restart does not begin from nothing
pub trait CheckpointStore: Send + Sync {
    /// Overwrite the stored checkpoint
    fn save(&self, state: &AccountState) -> Result<()>;

    /// Most recent checkpoint, `None` if nothing was ever saved
    fn load(&self) -> Result<Option<AccountState>>;
}

/// In-process store, used by tests and paper runs without a data dir
#[derive(Default)]
pub struct MemoryCheckpointStore {
    saved: Mutex<Option<AccountState>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, state: &AccountState) -> Result<()> {
        *self.saved.lock() = Some(state.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<AccountState>> {
        Ok(self.saved.lock().clone())
    }
}
