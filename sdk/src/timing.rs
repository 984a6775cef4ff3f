//! Wall clock helpers.

use std::time::{SystemTime, UNIX_EPOCH};

pub fn duration_as_ms(d: &std::time::Duration) -> u64 {
    (d.as_secs() * 1000) + u64::from(d.subsec_millis())
}

/// A duration as milliseconds since the Unix epoch.
pub fn timestamp() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("create timestamp in timing");
    duration_as_ms(&now)
}
