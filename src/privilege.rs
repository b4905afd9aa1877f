//! Privilege checks applied before the pool is launched.
use nix::unistd::{Uid, getuid};
use tracing::{error, warn};

use crate::error::ProcessError;

/// The real user id of the controlling process.
pub fn current_uid() -> Uid {
    getuid()
}

/// Refuses to launch as root unless explicitly allowed.
pub fn ensure_may_launch(uid: Uid, allow_root: bool) -> Result<(), ProcessError> {
    if !uid.is_root() {
        return Ok(());
    }

    if allow_root {
        warn!("Launching the pool as root because allow_root is set");
        Ok(())
    } else {
        error!("Refusing to launch the pool as root");
        Err(ProcessError::RootForbidden)
    }
}
