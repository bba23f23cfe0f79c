use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds since a process-local monotonic epoch.
///
/// All pipeline timestamps (`t_capture_ns`, `t_ref_ns`, error stamps) come
/// from this clock. It is comparable across threads but not across
/// processes; wall-clock stamps for manifests use `chrono` separately.
pub fn monotonic_now_ns() -> i64 {
    let epoch = EPOCH.get_or_init(Instant::now);
    let dur = epoch.elapsed();
    i64::try_from(dur.as_nanos()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic() {
        let a = monotonic_now_ns();
        let b = monotonic_now_ns();
        assert!(b >= a);
    }
}
