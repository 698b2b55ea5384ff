use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::errors::{FlowError, Result};
use crate::syntax::SyntaxRef;

/// Cooperative cancellation for flow construction.
///
/// Clones share the same flag. The builder polls it once per lowered node.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    canceled: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Relaxed);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Relaxed)
    }

    pub(crate) fn check(&self, node: SyntaxRef) -> Result<()> {
        if self.is_canceled() {
            return Err(FlowError::Canceled { node });
        }
        Ok(())
    }
}
