use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// Key of a TCP pseudo-connection: destination IP and port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub ip: IpAddr,
    pub port: u16,
}

impl From<SocketAddr> for FlowKey {
    fn from(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip(),
            port: addr.port(),
        }
    }
}

/// Per-flow TCP pseudo-connection state.
///
/// A random ISN is assigned on the first send; `seq_initialized` tracks
/// that separately so a sequence space that wraps to exactly 0 continues
/// from 0. The remote fields feed the ACK and TSecr computation of
/// outbound segments.
#[derive(Debug, Default)]
pub struct FlowState {
    pub next_seq: u32,
    pub seq_initialized: bool,
    pub last_remote_seq: u32,
    pub last_remote_inc: u32,
    pub last_remote_seen: bool,
    pub last_remote_tsval: u32,
}

impl FlowState {
    /// ACK value for the next outbound segment: cumulative position past the
    /// last observed remote segment, or 0 before anything was seen.
    pub fn ack_value(&self) -> u32 {
        if self.last_remote_seen {
            self.last_remote_seq.wrapping_add(self.last_remote_inc)
        } else {
            0
        }
    }

    /// Claim the sequence number for an outbound segment and advance
    /// `next_seq` by the consumed sequence space.
    pub fn claim_seq(&mut self, payload_len: u32, seq_increment: u32) -> u32 {
        if !self.seq_initialized {
            self.next_seq = random_isn();
            self.seq_initialized = true;
        }
        let seq = self.next_seq;
        self.next_seq = seq.wrapping_add(payload_len).wrapping_add(seq_increment);
        seq
    }

    /// Record an observed remote segment.
    pub fn observe(&mut self, seq: u32, inc: u32, tsval: Option<u32>) {
        self.last_remote_seq = seq;
        self.last_remote_inc = inc;
        self.last_remote_seen = true;
        if let Some(ts) = tsval {
            self.last_remote_tsval = ts;
        }
    }
}

fn random_isn() -> u32 {
    rand::random()
}

/// Table of flow states keyed by destination endpoint.
///
/// The map is guarded by a reader/writer lock; each entry carries its own
/// mutex. Entries are created lazily on first send or first observation and
/// live for the remainder of the process.
#[derive(Debug, Default)]
pub struct FlowTable {
    flows: RwLock<HashMap<FlowKey, Arc<Mutex<FlowState>>>>,
}

impl FlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch or lazily create the state of a flow. Lookup under the shared
    /// lock; insert re-checks under the exclusive lock.
    pub fn entry(&self, key: FlowKey) -> Arc<Mutex<FlowState>> {
        if let Some(state) = self.flows.read().get(&key) {
            return state.clone();
        }
        let mut flows = self.flows.write();
        flows
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(FlowState::default())))
            .clone()
    }

    /// Feed an observed inbound segment into the flow state of its source.
    pub fn observe(&self, src: SocketAddr, seq: u32, inc: u32, tsval: Option<u32>) {
        let state = self.entry(src.into());
        state.lock().observe(seq, inc, tsval);
    }

    pub fn len(&self) -> usize {
        self.flows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn key() -> FlowKey {
        FlowKey {
            ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            port: 443,
        }
    }

    #[test]
    fn test_claim_seq_assigns_random_isn() {
        let mut state = FlowState::default();
        assert!(!state.seq_initialized);
        let seq = state.claim_seq(0, 1);
        assert!(state.seq_initialized);
        assert_eq!(state.next_seq, seq.wrapping_add(1));
    }

    #[test]
    fn test_sequence_advance_empty_then_payload() {
        // SYN with no payload consumes one; 100-byte PSH+ACK consumes 100.
        let mut state = FlowState::default();
        let seq0 = state.claim_seq(0, 1);
        assert_eq!(state.next_seq, seq0.wrapping_add(1));

        let seq1 = state.claim_seq(100, 0);
        assert_eq!(seq1, seq0.wrapping_add(1));
        assert_eq!(state.next_seq, seq0.wrapping_add(101));
    }

    #[test]
    fn test_ack_echo() {
        let mut state = FlowState::default();
        assert_eq!(state.ack_value(), 0);

        // Remote PSH|ACK, seq 1000, 50 bytes.
        state.observe(1000, 50, None);
        assert_eq!(state.ack_value(), 1050);

        // Remote SYN, seq 2000, no payload.
        state.observe(2000, 1, None);
        assert_eq!(state.ack_value(), 2001);
    }

    #[test]
    fn test_tsval_tracking() {
        let mut state = FlowState::default();
        state.observe(1, 1, Some(777));
        assert_eq!(state.last_remote_tsval, 777);
        // A segment without the option keeps the previous echo value.
        state.observe(2, 1, None);
        assert_eq!(state.last_remote_tsval, 777);
    }

    #[test]
    fn test_seq_wraps() {
        let mut state = FlowState {
            next_seq: u32::MAX,
            seq_initialized: true,
            ..Default::default()
        };
        let seq = state.claim_seq(10, 0);
        assert_eq!(seq, u32::MAX);
        assert_eq!(state.next_seq, 9);
    }

    #[test]
    fn test_seq_wrapped_to_zero_continues() {
        // A sequence space that lands on exactly 0 must not re-randomize.
        let mut state = FlowState {
            next_seq: u32::MAX,
            seq_initialized: true,
            ..Default::default()
        };
        let seq = state.claim_seq(0, 1);
        assert_eq!(seq, u32::MAX);
        assert_eq!(state.next_seq, 0);

        let seq = state.claim_seq(100, 0);
        assert_eq!(seq, 0);
        assert_eq!(state.next_seq, 100);
    }

    #[test]
    fn test_table_lazy_entries() {
        let table = FlowTable::new();
        assert!(table.is_empty());
        let a = table.entry(key());
        let b = table.entry(key());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_table_observe_creates_flow() {
        let table = FlowTable::new();
        let src: SocketAddr = "10.0.0.2:5555".parse().unwrap();
        table.observe(src, 4000, 25, Some(12));
        let state = table.entry(src.into());
        let state = state.lock();
        assert_eq!(state.ack_value(), 4025);
        assert_eq!(state.last_remote_tsval, 12);
    }
}
