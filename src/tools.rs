//! Small helpers shared across the crate.

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock time as unix seconds.
pub fn epoch_secs() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs() as i64,
        Err(_) => 0,
    }
}
