use std::time::SystemTime;

/// Seconds elapsed since 1970-01-01. Feeds the unique-id generator, which
/// only needs a monotonically growing coarse clock.
#[inline]
pub fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("System clock is set before the unix epoch")
        .as_secs()
}
