//! Fleet sizing arithmetic.

/// Workers to add so every `per_worker` queued jobs have a worker, never
/// growing the fleet past `max_workers`.
pub fn scale_up_count(queue_len: usize, per_worker: usize, current: usize, max_workers: usize) -> usize {
    let required = queue_len.div_ceil(per_worker.max(1)).min(max_workers);
    required.saturating_sub(current)
}

/// Idle workers to reclaim when more than half the fleet is idle.
///
/// Removes just enough to bring the idle count back to half the fleet,
/// keeping at least `min_workers`.
pub fn reclaim_count(fleet: usize, idle: usize, min_workers: usize) -> usize {
    if idle * 2 <= fleet {
        return 0;
    }
    let needed = idle * 2 - fleet;
    needed.min(idle).min(fleet.saturating_sub(min_workers))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_up_rounds_up_and_caps() {
        assert_eq!(scale_up_count(0, 10, 0, 32), 0);
        assert_eq!(scale_up_count(1, 10, 0, 32), 1);
        assert_eq!(scale_up_count(25, 10, 1, 32), 2);
        assert_eq!(scale_up_count(25, 10, 3, 32), 0);
        assert_eq!(scale_up_count(1000, 10, 0, 32), 32);
        assert_eq!(scale_up_count(5, 0, 0, 32), 5);
    }

    #[test]
    fn reclaim_only_above_half() {
        assert_eq!(reclaim_count(4, 2, 0), 0);
        assert_eq!(reclaim_count(4, 3, 0), 2);
        assert_eq!(reclaim_count(4, 4, 0), 4);
        assert_eq!(reclaim_count(4, 4, 1), 3);
        assert_eq!(reclaim_count(1, 1, 1), 0);
        assert_eq!(reclaim_count(0, 0, 0), 0);
    }
}
