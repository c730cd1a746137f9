use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{CairnError, Result};

/// Return `Err(Interrupted)` once the caller's shutdown flag is set.
pub fn check_interrupted(shutdown: Option<&AtomicBool>) -> Result<()> {
    if shutdown.is_some_and(|f| f.load(Ordering::Relaxed)) {
        return Err(CairnError::Interrupted);
    }
    Ok(())
}
