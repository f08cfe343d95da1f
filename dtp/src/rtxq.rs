//! Retransmission Queue: sequence-ordered unacknowledged PDUs with
//! timestamps, retry counts, and an exponential-backoff timer (§4.3).
//!
//! Keeps a single ordered list walked by one externally-driven RTX timer
//! rather than one retry task per entry, matching the single-queue-timer
//! design the data model requires (RTXQ invariant 3, §3).
use crate::constants::SequenceNumber;
use crate::error::DtpError;
use crate::pdu::Pdu;
use crate::sv::StateVector;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A single unacknowledged PDU awaiting acknowledgement or retransmission.
struct Entry {
    pdu: Pdu,
    first_sent_ts: Instant,
    retries: u32,
}

struct Inner {
    entries: VecDeque<Entry>,
    timer_armed: bool,
    drop_pdus: u64,
}

/// `backoff(r, tr) = min(60_000ms, (1 + r*r) * tr)` (§4.3).
pub fn backoff(retries: u32, tr: Duration) -> Duration {
    const MAX_RTX_WAIT: Duration = Duration::from_millis(60_000);
    let factor = 1u64 + (retries as u64) * (retries as u64);
    tr.checked_mul(factor as u32)
        .map(|d| d.min(MAX_RTX_WAIT))
        .unwrap_or(MAX_RTX_WAIT)
}

/// A PDU due for (re)transmission, yielded by [`Rtxq::due`] and
/// [`Rtxq::nack`].
pub struct Retransmit {
    /// The sequence number being retransmitted.
    pub sequence_number: SequenceNumber,
    /// A fresh, independently-owned copy of the PDU to hand to the RMT.
    pub pdu: Pdu,
}

/// Outcome of [`Rtxq::nack`] / [`Rtxq::due`] walking the list.
pub struct NackOutcome {
    /// Entries to duplicate and hand to the RMT, in ascending seq order.
    pub retransmits: Vec<Retransmit>,
    /// Sequence numbers dropped for exhausting `data_retransmit_max`.
    pub dropped: Vec<SequenceNumber>,
}

/// Sequence-ordered list of sent, unacknowledged PDUs.
pub struct Rtxq {
    inner: Mutex<Inner>,
    data_retransmit_max: u32,
}

impl Rtxq {
    /// Creates an empty queue.
    pub fn new(data_retransmit_max: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                timer_armed: false,
                drop_pdus: 0,
            }),
            data_retransmit_max,
        }
    }

    /// Inserts `pdu`, which must carry the largest sequence number seen so
    /// far (the sender path only ever appends in increasing order).
    /// Duplicate insertion is a hard error (§4.3).
    pub fn push(&self, pdu: Pdu) -> Result<(), DtpError> {
        let mut inner = self.inner.lock().unwrap();
        let seq = pdu.sequence_number();
        if let Some(last) = inner.entries.back() {
            if last.pdu.sequence_number() >= seq {
                return Err(DtpError::DuplicateSeq(seq));
            }
        }
        inner.entries.push_back(Entry {
            pdu,
            first_sent_ts: Instant::now(),
            retries: 0,
        });
        inner.timer_armed = true;
        Ok(())
    }

    /// Removes every entry with `seq' <= seq` (cumulative ACK, §4.3).
    pub fn ack(&self, seq: SequenceNumber) {
        let mut inner = self.inner.lock().unwrap();
        while let Some(front) = inner.entries.front() {
            if front.pdu.sequence_number() <= seq {
                inner.entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Walks the list **from tail toward head** while `seq' >= seq`; bumps
    /// `retries`, drops entries meeting `data_retransmit_max`, otherwise
    /// schedules a duplicate for retransmission, respecting the rate budget
    /// exactly as `Cwq::deliver` does (§4.3). Once the rate budget would be
    /// exceeded by the next retransmit, the walk stops; untouched entries
    /// are left exactly as they were, to be picked up on the next run.
    pub fn nack(&self, seq: SequenceNumber, sv: &StateVector, rate_based: bool) -> NackOutcome {
        let mut inner = self.inner.lock().unwrap();
        let max_retries = self.data_retransmit_max;
        let mut retransmits = Vec::new();
        let mut dropped = Vec::new();
        let mut to_remove = Vec::new();
        for (idx, entry) in inner.entries.iter_mut().enumerate().rev() {
            if entry.pdu.sequence_number() < seq {
                break;
            }
            let bytes = entry.pdu.payload.len() as u32;
            if entry.retries + 1 >= max_retries {
                entry.retries += 1;
                dropped.push(entry.pdu.sequence_number());
                to_remove.push(idx);
                continue;
            }
            let rate_exceeded = rate_based
                && sv.with(|f| {
                    let rate = f.sndr_rate();
                    rate > 0 && (f.pdus_sent_in_time_unit() as u64 + bytes as u64) >= rate as u64
                });
            if rate_exceeded {
                break;
            }
            entry.retries += 1;
            if rate_based {
                sv.with(|f| {
                    let rate = f.sndr_rate();
                    let n = f.pdus_sent_in_time_unit() + bytes;
                    f.set_pdus_sent_in_time_unit(if rate > 0 { n.min(rate) } else { n });
                });
            }
            retransmits.push(Retransmit {
                sequence_number: entry.pdu.sequence_number(),
                pdu: entry.pdu.duplicate(),
            });
        }
        for idx in to_remove {
            inner.entries.remove(idx);
        }
        inner.drop_pdus += dropped.len() as u64;
        retransmits.reverse();
        NackOutcome { retransmits, dropped }
    }

    /// Returns `first_sent_ts` for `seq` if resident and unretried, `None`
    /// if it has been retransmitted (excluded from RTT sampling per the
    /// tri-state contract in §4.3/§4.10), or [`DtpError::NotFound`] if no
    /// entry with that sequence number is resident.
    pub fn timestamp(&self, seq: SequenceNumber) -> Result<Option<Instant>, DtpError> {
        let inner = self.inner.lock().unwrap();
        for entry in &inner.entries {
            if entry.pdu.sequence_number() == seq {
                return Ok(if entry.retries == 0 {
                    Some(entry.first_sent_ts)
                } else {
                    None
                });
            }
        }
        Err(DtpError::NotFound(seq))
    }

    /// Destroys every resident entry and disarms the timer.
    pub fn flush(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.timer_armed = false;
    }

    /// Number of resident entries.
    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Total PDUs dropped for exhausting retries over the queue's lifetime.
    pub fn drop_pdus(&self) -> u64 {
        self.inner.lock().unwrap().drop_pdus
    }

    /// The largest sequence number currently resident, if any. Used by the
    /// sender-rendezvous interaction (§4.3) to advance `snd_lft_win` after a
    /// drop.
    pub fn max_sequence_number(&self) -> Option<SequenceNumber> {
        self.inner.lock().unwrap().entries.back().map(|e| e.pdu.sequence_number())
    }

    /// Invoked by the RTX timer: walks from head, collecting every entry
    /// whose deadline `first_sent_ts + backoff(retries, tr)` has elapsed.
    /// Each due entry is treated exactly like a NACK-triggered retransmit
    /// for its own sequence number, respecting the rate budget exactly as
    /// `Cwq::deliver` does. The walk stops at the first entry not yet due
    /// (the list is ordered by insertion and therefore by non-decreasing
    /// deadline), or at the first entry that would overrun the rate budget,
    /// whichever comes first; entries past that point are left untouched.
    pub fn due(&self, tr: Duration, sv: &StateVector, rate_based: bool) -> NackOutcome {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let max_retries = self.data_retransmit_max;
        let mut retransmits = Vec::new();
        let mut dropped = Vec::new();
        let mut to_remove = Vec::new();
        for (idx, entry) in inner.entries.iter_mut().enumerate() {
            let deadline = entry.first_sent_ts + backoff(entry.retries, tr);
            if deadline > now {
                break;
            }
            let bytes = entry.pdu.payload.len() as u32;
            if entry.retries + 1 >= max_retries {
                entry.retries += 1;
                dropped.push(entry.pdu.sequence_number());
                to_remove.push(idx);
                continue;
            }
            let rate_exceeded = rate_based
                && sv.with(|f| {
                    let rate = f.sndr_rate();
                    rate > 0 && (f.pdus_sent_in_time_unit() as u64 + bytes as u64) >= rate as u64
                });
            if rate_exceeded {
                break;
            }
            entry.retries += 1;
            if rate_based {
                sv.with(|f| {
                    let rate = f.sndr_rate();
                    let n = f.pdus_sent_in_time_unit() + bytes;
                    f.set_pdus_sent_in_time_unit(if rate > 0 { n.min(rate) } else { n });
                });
            }
            retransmits.push(Retransmit {
                sequence_number: entry.pdu.sequence_number(),
                pdu: entry.pdu.duplicate(),
            });
        }
        for idx in to_remove.into_iter().rev() {
            inner.entries.remove(idx);
        }
        inner.drop_pdus += dropped.len() as u64;
        inner.timer_armed = !inner.entries.is_empty();
        NackOutcome { retransmits, dropped }
    }

    /// Whether the RTX timer should remain armed.
    pub fn timer_armed(&self) -> bool {
        self.inner.lock().unwrap().timer_armed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pci::{Pci, PduType};
    use crate::sv::StateVectorConfig;
    use bytes::Bytes;

    fn sv() -> StateVector {
        StateVector::new(StateVectorConfig {
            initial_seq_num: 0,
            mpl: Duration::from_millis(1000),
            r: Duration::from_millis(100),
            a: Duration::from_millis(200),
            initial_tr: Duration::from_millis(300),
            window_based: false,
            rate_based: false,
            rexmsn_ctrl: true,
            initial_credit: 2,
            rcvr_credit: 2,
            time_unit: Duration::from_millis(1000),
        })
    }

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
    fn push_rejects_duplicate_or_out_of_order_seq() {
        let q = Rtxq::new(3);
        q.push(pdu(1)).unwrap();
        q.push(pdu(2)).unwrap();
        assert!(matches!(q.push(pdu(2)), Err(DtpError::DuplicateSeq(2))));
        assert!(matches!(q.push(pdu(1)), Err(DtpError::DuplicateSeq(1))));
    }

    #[test]
    fn ack_removes_up_to_and_including_seq() {
        let q = Rtxq::new(3);
        q.push(pdu(1)).unwrap();
        q.push(pdu(2)).unwrap();
        q.push(pdu(3)).unwrap();
        q.ack(2);
        assert_eq!(q.size(), 1);
        assert_eq!(q.timestamp(3).unwrap().is_some(), true);
        assert!(matches!(q.timestamp(1), Err(DtpError::NotFound(1))));
    }

    #[test]
    fn nack_retransmits_from_tail_and_drops_on_exhaustion() {
        let q = Rtxq::new(2);
        q.push(pdu(1)).unwrap();
        q.push(pdu(2)).unwrap();
        q.push(pdu(3)).unwrap();
        let sv = sv();
        let outcome = q.nack(2, &sv, false);
        assert_eq!(outcome.retransmits.len(), 2);
        assert_eq!(outcome.dropped.len(), 0);
        // Second nack on seq 2 and 3 pushes their retry count to the max.
        let outcome = q.nack(2, &sv, false);
        assert!(outcome.dropped.contains(&2));
        assert!(outcome.dropped.contains(&3));
        assert_eq!(q.size(), 1);
    }

    #[test]
    fn timestamp_is_none_after_retransmit() {
        let q = Rtxq::new(5);
        q.push(pdu(1)).unwrap();
        assert!(q.timestamp(1).unwrap().is_some());
        q.nack(1, &sv(), false);
        assert!(q.timestamp(1).unwrap().is_none());
    }

    #[test]
    fn nack_stops_without_retransmitting_once_rate_budget_exhausted() {
        let q = Rtxq::new(5);
        q.push(pdu(1)).unwrap();
        q.push(pdu(2)).unwrap();
        let sv = sv();
        sv.with(|f| {
            f.set_sndr_rate(1);
            f.set_pdus_sent_in_time_unit(1);
        });
        let outcome = q.nack(1, &sv, true);
        assert!(outcome.retransmits.is_empty());
        assert!(outcome.dropped.is_empty());
        assert_eq!(q.size(), 2);
        assert!(q.timestamp(1).unwrap().is_some());
        assert!(q.timestamp(2).unwrap().is_some());
    }

    #[test]
    fn backoff_caps_at_sixty_seconds() {
        let tr = Duration::from_millis(1000);
        assert_eq!(backoff(0, tr), Duration::from_millis(1000));
        assert_eq!(backoff(1, tr), Duration::from_millis(2000));
        assert_eq!(backoff(1000, tr), Duration::from_millis(60_000));
    }

    #[test]
    fn due_retransmits_past_deadline_and_rearms() {
        let q = Rtxq::new(3);
        q.push(pdu(1)).unwrap();
        let outcome = q.due(Duration::from_millis(0), &sv(), false);
        assert_eq!(outcome.retransmits.len(), 1);
        assert!(q.timer_armed());
    }

    #[test]
    fn due_stops_without_retransmitting_once_rate_budget_exhausted() {
        let q = Rtxq::new(5);
        q.push(pdu(1)).unwrap();
        q.push(pdu(2)).unwrap();
        let sv = sv();
        sv.with(|f| {
            f.set_sndr_rate(1);
            f.set_pdus_sent_in_time_unit(1);
        });
        let outcome = q.due(Duration::from_millis(0), &sv, true);
        assert!(outcome.retransmits.is_empty());
        assert!(outcome.dropped.is_empty());
        assert_eq!(q.size(), 2);
    }

    #[test]
    fn flush_clears_and_disarms() {
        let q = Rtxq::new(3);
        q.push(pdu(1)).unwrap();
        q.flush();
        assert!(q.is_empty());
        assert!(!q.timer_armed());
    }
}
