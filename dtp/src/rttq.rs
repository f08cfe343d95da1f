//! RTT Queue: used when retransmission control is off but RTT estimation is
//! still wanted (§4.4). Same ordering discipline as the RTXQ but stores only
//! `(seq, ts)` pairs, since there is no PDU to retain for retransmission.
use crate::constants::SequenceNumber;
use crate::error::DtpError;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

struct Inner {
    entries: VecDeque<(SequenceNumber, Instant)>,
}

/// Sequence-ordered `(seq, timestamp)` pairs awaiting an ACK for RTT
/// sampling.
pub struct Rttq {
    inner: Mutex<Inner>,
}

impl Rttq {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
            }),
        }
    }

    /// Inserts `(seq, now)`, appended in increasing sequence order.
    pub fn push(&self, seq: SequenceNumber) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.push_back((seq, Instant::now()));
    }

    /// Removes every entry with `seq' <= seq`.
    pub fn drop_acked(&self, seq: SequenceNumber) {
        let mut inner = self.inner.lock().unwrap();
        while let Some(&(s, _)) = inner.entries.front() {
            if s <= seq {
                inner.entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Looks up the timestamp recorded for `seq`.
    pub fn timestamp(&self, seq: SequenceNumber) -> Result<Instant, DtpError> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .iter()
            .find(|&&(s, _)| s == seq)
            .map(|&(_, ts)| ts)
            .ok_or(DtpError::NotFound(seq))
    }

    /// Destroys every resident entry.
    pub fn flush(&self) {
        self.inner.lock().unwrap().entries.clear();
    }

    /// Number of resident entries.
    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}

impl Default for Rttq {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_lookup() {
        let q = Rttq::new();
        q.push(1);
        q.push(2);
        assert!(q.timestamp(1).is_ok());
        assert!(q.timestamp(2).is_ok());
        assert!(matches!(q.timestamp(3), Err(DtpError::NotFound(3))));
    }

    #[test]
    fn drop_acked_removes_prefix() {
        let q = Rttq::new();
        q.push(1);
        q.push(2);
        q.push(3);
        q.drop_acked(2);
        assert_eq!(q.size(), 1);
        assert!(q.timestamp(3).is_ok());
    }

    #[test]
    fn flush_clears() {
        let q = Rttq::new();
        q.push(1);
        q.flush();
        assert_eq!(q.size(), 0);
    }
}
