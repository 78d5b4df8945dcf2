use node_common::TrafficSnapshot;

/// True when either counter went backward since the last observation, which
/// means the container or its interface was replaced.
pub fn is_counter_reset(last: TrafficSnapshot, current: TrafficSnapshot) -> bool {
    current.total_bytes_in < last.total_bytes_in || current.total_bytes_out < last.total_bytes_out
}

/// Bytes transferred (in plus out) between two observations of the same
/// container. A counter reset yields zero for the cycle.
pub fn compute_delta(last: TrafficSnapshot, current: TrafficSnapshot) -> u64 {
    if is_counter_reset(last, current) {
        return 0;
    }
    let rx = current.total_bytes_in - last.total_bytes_in;
    let tx = current.total_bytes_out - last.total_bytes_out;
    rx.saturating_add(tx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_growth_in_both_directions() {
        let last = TrafficSnapshot::new(100, 50);
        let current = TrafficSnapshot::new(150, 80);
        assert_eq!(compute_delta(last, current), 80);
        assert!(!is_counter_reset(last, current));
    }

    #[test]
    fn test_rx_regression_is_zero() {
        let last = TrafficSnapshot::new(100, 50);
        let current = TrafficSnapshot::new(40, 80);
        assert!(is_counter_reset(last, current));
        assert_eq!(compute_delta(last, current), 0);
    }

    #[test]
    fn test_tx_regression_is_zero() {
        assert_eq!(
            compute_delta(TrafficSnapshot::new(10, 500), TrafficSnapshot::new(900, 20)),
            0
        );
    }

    #[test]
    fn test_first_observation_counts_from_zero() {
        assert_eq!(
            compute_delta(TrafficSnapshot::default(), TrafficSnapshot::new(1024, 512)),
            1536
        );
    }

    #[test]
    fn test_unchanged_counters() {
        let snapshot = TrafficSnapshot::new(7, 7);
        assert_eq!(compute_delta(snapshot, snapshot), 0);
    }

    #[test]
    fn test_sum_saturates() {
        let current = TrafficSnapshot::new(u64::MAX, u64::MAX);
        assert_eq!(compute_delta(TrafficSnapshot::default(), current), u64::MAX);
    }
}
