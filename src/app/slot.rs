use crate::core::{Context, Result};
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;

/// The process-wide active model.
///
/// Readers take a clone of the `Arc` and drop the lock before doing any
/// work, so a swap never waits on inference and an old context lives until
/// its last in-flight user lets go of it.
pub struct ModelSlot {
    active: RwLock<Option<Arc<Context>>>,
}

impl ModelSlot {
    pub fn new() -> Self {
        Self {
            active: RwLock::new(None),
        }
    }

    pub fn current(&self) -> Option<Arc<Context>> {
        self.active.read().clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.active.read().is_some()
    }

    /// Installs `ctx` and returns the context it replaced.
    pub fn swap(&self, ctx: Context) -> Option<Arc<Context>> {
        self.active.write().replace(Arc::new(ctx))
    }

    pub fn clear(&self) -> Option<Arc<Context>> {
        self.active.write().take()
    }

    /// Loads `path` and swaps it in. On failure the current model stays.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let ctx = Context::load(path)?;
        tracing::info!("activated model {}", path.display());
        self.swap(ctx);
        Ok(())
    }
}

impl Default for ModelSlot {
    fn default() -> Self {
        Self::new()
    }
}
