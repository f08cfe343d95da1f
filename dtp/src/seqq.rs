//! Sequencing Queue: out-of-order received PDUs held until the A-timer
//! releases them or in-order arrival fills the gap (§4.5).
use crate::constants::SequenceNumber;
use crate::pdu::Pdu;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Held {
    pdu: Pdu,
    enqueue_ts: Instant,
}

struct Inner {
    entries: VecDeque<Held>,
}

/// Sequence-ordered holding queue for out-of-order PDUs awaiting in-order
/// delivery.
pub struct SeqQ {
    inner: Mutex<Inner>,
}

/// Outcome of draining the queue on A-timer expiration or in-order arrival.
pub struct Drained {
    /// PDUs ready to post upward, in ascending sequence order.
    pub to_post: Vec<Pdu>,
    /// Advanced left window edge after the walk, if it moved.
    pub new_lwe: Option<SequenceNumber>,
}

impl SeqQ {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
            }),
        }
    }

    /// Inserts `pdu`, keeping the queue strictly ascending by sequence
    /// number (§3 invariant 4).
    pub fn insert(&self, pdu: Pdu) {
        let mut inner = self.inner.lock().unwrap();
        let seq = pdu.sequence_number();
        let pos = inner
            .entries
            .iter()
            .position(|h| h.pdu.sequence_number() > seq)
            .unwrap_or_else(|| inner.entries.len());
        inner.entries.insert(
            pos,
            Held {
                pdu,
                enqueue_ts: Instant::now(),
            },
        );
    }

    /// Destroys every resident PDU.
    pub fn flush(&self) {
        self.inner.lock().unwrap().entries.clear();
    }

    /// Number of resident PDUs.
    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Walks the queue from the head draining every entry that is either
    /// contiguous with `lwe` or whose A-timer has expired (§4.5 step 1).
    /// With `rtx_ctrl` on, any entry whose A-timer has expired is dropped
    /// unconditionally, contiguous or not, on the expectation that a
    /// retransmission will resupply it; without RTX control it is delivered
    /// as-is.
    pub fn drain(&self, lwe: SequenceNumber, a: Duration, max_sdu_gap: u64, rtx_ctrl: bool) -> Drained {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let mut edge = lwe;
        let mut to_post = Vec::new();
        loop {
            let head = match inner.entries.front() {
                Some(head) => head,
                None => break,
            };
            let seq = head.pdu.sequence_number();
            let expired = head.enqueue_ts + a <= now;
            let within_gap = seq <= edge + 1 + max_sdu_gap;
            if !expired && !within_gap {
                break;
            }
            let held = inner.entries.pop_front().unwrap();
            if expired && rtx_ctrl {
                // A-timer expired with RTX control on: drop unconditionally
                // and wait for the retransmission rather than deliver.
                continue;
            }
            edge = seq;
            to_post.push(held.pdu);
        }
        Drained {
            to_post,
            new_lwe: if edge != lwe { Some(edge) } else { None },
        }
    }
}

impl Default for SeqQ {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pci::{Pci, PduType};
    use bytes::Bytes;

    fn pdu(seq: u64) -> Pdu {
        Pdu::new(
            Pci {
                pdu_type: PduType::Dt,
                flags: 0,
                source: "/ip4/127.0.0.1/udp/1".parse().unwrap(),
                destination: "/ip4/127.0.0.1/udp/2".parse().unwrap(),
                source_cep_id: 1,
                destination_cep_id: 1,
                qos_id: 0,
                sequence_number: seq,
                length: 0,
                ttl: 1,
                ack_nack_seq_num: 0,
                new_rt_wind_edge: 0,
                new_lf_wind_edge: 0,
                my_rt_wind_edge: 0,
                my_lf_wind_edge: 0,
                last_ctrl_seq_num_rcvd: 0,
                sndr_rate: 0,
                time_frame: 0,
            },
            Bytes::new(),
        )
    }

    #[test]
    fn insert_keeps_ascending_order() {
        let q = SeqQ::new();
        q.insert(pdu(3));
        q.insert(pdu(1));
        q.insert(pdu(2));
        let drained = q.drain(0, Duration::from_secs(0), 10, false);
        let seqs: Vec<_> = drained.to_post.iter().map(|p| p.sequence_number()).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn drain_stops_at_first_gap_without_expiry() {
        let q = SeqQ::new();
        q.insert(pdu(2));
        q.insert(pdu(4));
        let drained = q.drain(0, Duration::from_secs(1000), 0, true);
        assert!(drained.to_post.is_empty());
        assert_eq!(q.size(), 2);
    }

    #[test]
    fn drain_contiguous_run_advances_lwe() {
        let q = SeqQ::new();
        q.insert(pdu(1));
        q.insert(pdu(2));
        q.insert(pdu(4));
        let drained = q.drain(0, Duration::from_secs(1000), 0, true);
        assert_eq!(drained.new_lwe, Some(2));
        assert_eq!(drained.to_post.len(), 2);
        assert_eq!(q.size(), 1);
    }

    #[test]
    fn expired_gap_dropped_when_rtx_on() {
        let q = SeqQ::new();
        q.insert(pdu(5));
        let drained = q.drain(0, Duration::from_secs(0), 0, true);
        assert!(drained.to_post.is_empty());
        assert!(q.is_empty());
    }

    #[test]
    fn expired_contiguous_entry_still_dropped_when_rtx_on() {
        let q = SeqQ::new();
        q.insert(pdu(1));
        let drained = q.drain(0, Duration::from_secs(0), 0, true);
        assert!(drained.to_post.is_empty());
        assert_eq!(drained.new_lwe, None);
        assert!(q.is_empty());
    }

    #[test]
    fn flush_clears() {
        let q = SeqQ::new();
        q.insert(pdu(1));
        q.flush();
        assert!(q.is_empty());
    }
}
