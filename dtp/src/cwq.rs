//! Closed-Window Queue: a FIFO of PDUs blocked by window or rate budget
//! (§4.2), drained once credit reopens.
//!
//! Built around the [`StateVector`] introduced to break the dtp/dtcp
//! circular dependency (§10.1).
use crate::error::DtpError;
use crate::pdu::Pdu;
use crate::policy::PduSink;
use crate::rttq::Rttq;
use crate::rtxq::Rtxq;
use crate::sv::StateVector;
use std::collections::VecDeque;
use std::sync::Mutex;

struct Inner {
    entries: VecDeque<Pdu>,
    max_len: usize,
}

/// FIFO of PDUs the sender could not transmit immediately.
pub struct Cwq {
    inner: Mutex<Inner>,
}

impl Cwq {
    /// Creates an empty queue bounded by `max_closed_winq_length`.
    pub fn new(max_len: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                max_len,
            }),
        }
    }

    /// Appends `pdu`. Fails with [`DtpError::QueueFull`] at capacity.
    pub fn push(&self, pdu: Pdu) -> Result<(), DtpError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.len() >= inner.max_len {
            return Err(DtpError::QueueFull);
        }
        inner.entries.push_back(pdu);
        Ok(())
    }

    /// Force-pushes `pdu` even at or past capacity, used by
    /// `snd_flow_control_overrun` (§4.6 step 4) which accepts the overrun
    /// rather than dropping the SDU.
    pub fn force_push(&self, pdu: Pdu) {
        self.inner.lock().unwrap().entries.push_back(pdu);
    }

    /// Removes and returns the head PDU, if any.
    pub fn pop(&self) -> Option<Pdu> {
        self.inner.lock().unwrap().entries.pop_front()
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

    /// Whether the queue has dropped below its configured bound, i.e.
    /// whether upper-layer write may be safely re-enabled (§4.2, final
    /// paragraph).
    pub fn below_threshold(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.entries.len() < inner.max_len
    }

    /// Drains as many head PDUs as the sender may still send (§4.2
    /// `cwq_deliver`): while [`can_deliver`] permits, pop the head, enqueue
    /// it onto the RTXQ (RTX control on) or RTTQ (RTT estimation only),
    /// account its bytes into the rate-window counter when rate-based, and
    /// hand it to `sink`, which routes to the external `Rmt` or loops the
    /// PDU back locally, whichever this connection needs. Stops when the
    /// queue empties or sending is blocked again, setting
    /// `window_closed`/`rate_fulfiled` as appropriate so the caller knows
    /// why draining stopped.
    pub async fn deliver(
        &self,
        sv: &StateVector,
        rtxq: &Rtxq,
        rttq: &Rttq,
        sink: &dyn PduSink,
        window_based: bool,
        rate_based: bool,
        rexmsn_ctrl: bool,
        reconcile: impl Fn() -> bool,
    ) -> Result<(), DtpError> {
        loop {
            let head_bytes = {
                let inner = self.inner.lock().unwrap();
                match inner.entries.front() {
                    Some(p) => p.payload.len() as u32,
                    None => break,
                }
            };
            let rate_exceeded = rate_based
                && sv.with(|f| {
                    let rate = f.sndr_rate();
                    rate > 0 && (f.pdus_sent_in_time_unit() as u64 + head_bytes as u64) >= rate as u64
                });
            if !can_deliver(sv, window_based, rate_based, rate_exceeded, &reconcile) {
                if window_based {
                    sv.with(|f| {
                        if f.max_seq_nr_sent() >= f.snd_rt_wind_edge() {
                            f.set_window_closed(true);
                        }
                    });
                }
                if rate_based && rate_exceeded {
                    sv.with(|f| f.set_rate_fulfiled(true));
                }
                break;
            }
            let pdu = {
                let mut inner = self.inner.lock().unwrap();
                inner.entries.pop_front().expect("checked non-empty above")
            };
            let seq = pdu.sequence_number();
            if rexmsn_ctrl {
                rtxq.push(pdu.duplicate())?;
            } else {
                rttq.push(seq);
            }
            if rate_based {
                sv.with(|f| {
                    let rate = f.sndr_rate();
                    let n = f.pdus_sent_in_time_unit() + head_bytes;
                    f.set_pdus_sent_in_time_unit(if rate > 0 { n.min(rate) } else { n });
                });
            }
            sv.with(|f| {
                f.set_max_seq_nr_sent(seq);
                f.set_snd_lft_win(seq);
            });
            let bytes = pdu.payload.len() as u64;
            sink.send(pdu.duplicate()).await.map_err(|_| DtpError::Downstream)?;
            sv.record_tx(bytes);
        }
        Ok(())
    }
}

/// Window-based and rate-based admission check, §4.2 `can_deliver`.
///
/// Returns `true` iff the sender may transmit one more PDU right now. When
/// window-based and rate-based checks disagree, `reconcile` (the
/// `reconcile_flow_conflict` policy hook) decides.
pub fn can_deliver(
    sv: &StateVector,
    window_based: bool,
    rate_based: bool,
    rate_exceeded: bool,
    reconcile: impl FnOnce() -> bool,
) -> bool {
    let window_ok = sv.with(|f| f.max_seq_nr_sent() < f.snd_rt_wind_edge());
    let rate_ok = !rate_exceeded;
    match (window_based, rate_based) {
        (true, true) => {
            if window_ok == rate_ok {
                window_ok
            } else {
                reconcile()
            }
        }
        (true, false) => window_ok,
        (false, true) => rate_ok,
        (false, false) => true,
    }
}
