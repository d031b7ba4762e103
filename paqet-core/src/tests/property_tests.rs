//! Property tests for the pipeline and scheduling invariants.

use crate::client::retry_backoff;
use crate::config::TcpFlags;
use crate::flow::FlowState;
use crate::packet::send::calculate_backoff;
use crate::util::iterator::RoundRobin;
use proptest::prelude::*;
use std::time::Duration;

proptest! {
    /// Send-pipeline backoff never exceeds the cap plus 20% jitter, and
    /// never undershoots the exponential base below the cap.
    #[test]
    fn send_backoff_bounded(
        initial_ms in 1u64..1000,
        max_ms in 1000u64..60_000,
        retries in 1u32..24,
    ) {
        let d = calculate_backoff(
            Duration::from_millis(initial_ms),
            Duration::from_millis(max_ms),
            retries,
        );
        let base = initial_ms
            .saturating_mul(1u64.checked_shl(retries - 1).unwrap_or(u64::MAX))
            .min(max_ms);
        let upper = base + base / 5 + 1;
        prop_assert!(d.as_millis() as u64 >= base);
        prop_assert!(d.as_millis() as u64 <= upper);
    }

    /// Stream-open retry backoff is monotone in the attempt number and
    /// capped.
    #[test]
    fn retry_backoff_monotone_and_capped(
        initial_ms in 10u64..1000,
        max_ms in 1000u64..60_000,
        attempt in 0usize..40,
    ) {
        let initial = Duration::from_millis(initial_ms);
        let max = Duration::from_millis(max_ms);
        let a = retry_backoff(initial, max, attempt);
        let b = retry_backoff(initial, max, attempt + 1);
        prop_assert!(a <= b);
        prop_assert!(a <= max);
        prop_assert!(b <= max);
    }

    /// For N ring slots and K picks, every slot is chosen at least
    /// floor(K/N) times.
    #[test]
    fn round_robin_fairness(n in 1usize..16, k in 1usize..200) {
        let it = RoundRobin::new((0..n).collect::<Vec<usize>>());
        let mut counts = vec![0usize; n];
        for _ in 0..k {
            counts[*it.next().unwrap()] += 1;
        }
        for c in counts {
            prop_assert!(c >= k / n);
            prop_assert!(c <= k / n + 1);
        }
    }

    /// The flag alphabet is exactly {F,S,R,P,A,U,E,C,N}; anything else is
    /// rejected.
    #[test]
    fn flag_parse_alphabet(s in "[A-Z]{1,9}") {
        let result = TcpFlags::parse(&s);
        let valid = s.chars().all(|c| "FSRPAUECN".contains(c));
        prop_assert_eq!(result.is_ok(), valid);
    }

    /// Sequence numbers advance by payload length plus one for SYN/FIN,
    /// with wrapping arithmetic.
    #[test]
    fn sequence_advance_law(
        start in any::<u32>(),
        payload_len in 0u32..65_536,
        syn in any::<bool>(),
        fin in any::<bool>(),
    ) {
        let mut state = FlowState {
            next_seq: start,
            seq_initialized: true,
            ..Default::default()
        };
        let inc = if syn || fin { 1 } else { 0 };
        let seq = state.claim_seq(payload_len, inc);
        prop_assert_eq!(seq, start);
        prop_assert_eq!(state.next_seq, start.wrapping_add(payload_len).wrapping_add(inc));
    }

    /// The ACK we emit is always the observed remote seq plus its
    /// sequence-space consumption.
    #[test]
    fn ack_echo_law(seq in any::<u32>(), len in 0u32..65_536, flagged in any::<bool>()) {
        let mut state = FlowState::default();
        let inc = len + u32::from(flagged);
        state.observe(seq, inc, None);
        prop_assert_eq!(state.ack_value(), seq.wrapping_add(inc));
    }
}
