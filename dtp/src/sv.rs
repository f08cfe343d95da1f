//! Per-connection State Vector: every variable read or written by both DTP
//! and DTCP, serialized by a single lock (§3, §4.1).
//!
//! A `std::sync::Mutex` around plain `Instant`/`Duration` state, widened
//! from a pair of atomics into the full per-connection variable set the
//! data model names.
use crate::constants::SequenceNumber;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// PDU/byte counters, all mutated under `sv_lock`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Stats {
    /// PDUs dropped (duplicates, overruns, retries-exhausted).
    pub drop_pdus: u64,
    /// PDUs dropped due to malformed PCI or failed send.
    pub err_pdus: u64,
    /// PDUs handed to the RMT.
    pub tx_pdus: u64,
    /// PDUs accepted from the RMT.
    pub rx_pdus: u64,
    /// Bytes handed to the RMT.
    pub tx_bytes: u64,
    /// Bytes accepted from the RMT.
    pub rx_bytes: u64,
}

#[derive(Debug)]
struct Inner {
    // Sender.
    seq_nr_to_send: SequenceNumber,
    max_seq_nr_sent: SequenceNumber,
    drf_flag: bool,
    window_closed: bool,
    rate_fulfiled: bool,
    rexmsn_ctrl: bool,
    window_based: bool,
    rate_based: bool,
    drf_required: bool,

    // Receiver.
    rcv_left_window_edge: SequenceNumber,
    max_seq_nr_rcv: SequenceNumber,

    // Timeouts.
    mpl: Duration,
    r: Duration,
    a: Duration,
    tr: Duration,

    // DTCP sender.
    next_snd_ctl_seq: SequenceNumber,
    last_snd_data_ack: SequenceNumber,
    snd_lft_win: SequenceNumber,
    snd_rt_wind_edge: SequenceNumber,
    sndr_credit: u64,
    sndr_rate: u32,
    pdus_sent_in_time_unit: u32,
    rendezvous_sndr: bool,

    // DTCP receiver.
    last_rcv_ctl_seq: SequenceNumber,
    last_rcv_data_ack: SequenceNumber,
    rcvr_credit: u64,
    rcvr_rt_wind_edge: SequenceNumber,
    rcvr_rate: u32,
    pdus_rcvd_in_time_unit: u32,
    rendezvous_rcvr: bool,
    last_time: Instant,
    time_unit: Duration,

    // RTT (all in milliseconds, matching the fixed-point arithmetic in
    // the default rtt estimator).
    rtt: i64,
    srtt: i64,
    rttvar: i64,

    stats: Stats,
}

/// The shared per-connection state, access to every field serialized by one
/// lock.
pub struct StateVector {
    inner: Mutex<Inner>,
}

/// Initial values needed to construct a [`StateVector`].
pub struct StateVectorConfig {
    /// Initial sequence number (random, nonzero, per connection lifecycle).
    pub initial_seq_num: SequenceNumber,
    /// Maximum PDU lifetime.
    pub mpl: Duration,
    /// Maximum time spent retransmitting.
    pub r: Duration,
    /// Delayed-ack / reassembly bound.
    pub a: Duration,
    /// Initial retransmission timeout.
    pub initial_tr: Duration,
    /// Whether window-based flow control is active.
    pub window_based: bool,
    /// Whether rate-based flow control is active.
    pub rate_based: bool,
    /// Whether retransmission control is active.
    pub rexmsn_ctrl: bool,
    /// Initial sender credit (right window edge offset).
    pub initial_credit: u64,
    /// Initial receiver credit.
    pub rcvr_credit: u64,
    /// Rate window length.
    pub time_unit: Duration,
}

impl StateVector {
    /// Builds a fresh state vector for a newly allocated connection.
    pub fn new(cfg: StateVectorConfig) -> Self {
        let now = Instant::now();
        Self {
            inner: Mutex::new(Inner {
                seq_nr_to_send: cfg.initial_seq_num,
                max_seq_nr_sent: cfg.initial_seq_num,
                drf_flag: true,
                window_closed: false,
                rate_fulfiled: false,
                rexmsn_ctrl: cfg.rexmsn_ctrl,
                window_based: cfg.window_based,
                rate_based: cfg.rate_based,
                drf_required: true,

                rcv_left_window_edge: 0,
                max_seq_nr_rcv: 0,

                mpl: cfg.mpl,
                r: cfg.r,
                a: cfg.a,
                tr: cfg.initial_tr,

                next_snd_ctl_seq: 0,
                last_snd_data_ack: 0,
                snd_lft_win: cfg.initial_seq_num,
                snd_rt_wind_edge: cfg.initial_seq_num + cfg.initial_credit,
                sndr_credit: cfg.initial_credit,
                sndr_rate: 0,
                pdus_sent_in_time_unit: 0,
                rendezvous_sndr: false,

                last_rcv_ctl_seq: 0,
                last_rcv_data_ack: 0,
                rcvr_credit: cfg.rcvr_credit,
                rcvr_rt_wind_edge: cfg.rcvr_credit,
                rcvr_rate: 0,
                pdus_rcvd_in_time_unit: 0,
                rendezvous_rcvr: false,
                last_time: now,
                time_unit: cfg.time_unit,

                rtt: 0,
                srtt: 0,
                rttvar: 0,

                stats: Stats::default(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<Inner> {
        self.inner.lock().unwrap()
    }

    /// Allocates the next sender sequence number and returns it.
    pub fn next_send_seq(&self) -> SequenceNumber {
        let mut inner = self.lock();
        inner.seq_nr_to_send += 1;
        inner.seq_nr_to_send
    }

    /// `rcvr_rt_wind_edge := rcv_left_window_edge + rcvr_credit`, never
    /// shrinking the edge (TCP-style non-shrinking window rule, §4.1).
    pub fn update_rt_wind_edge(&self) {
        let mut inner = self.lock();
        let candidate = inner.rcv_left_window_edge + inner.rcvr_credit;
        if candidate > inner.rcvr_rt_wind_edge {
            inner.rcvr_rt_wind_edge = candidate;
        }
    }

    /// Atomically updates `rcvr_credit` and bumps `rcvr_rt_wind_edge` if the
    /// resulting edge would be larger than the current one.
    pub fn update_credit_and_rt_wind_edge(&self, credit: u64) {
        let mut inner = self.lock();
        inner.rcvr_credit = credit;
        let candidate = inner.rcv_left_window_edge + credit;
        if candidate > inner.rcvr_rt_wind_edge {
            inner.rcvr_rt_wind_edge = candidate;
        }
    }

    /// Runs `f` with exclusive access to the inner state. Used by the
    /// policy-set hooks, which need to read and write several fields
    /// atomically (e.g. `window_is_closed`).
    pub fn with<R>(&self, f: impl FnOnce(&mut SvFields) -> R) -> R {
        let mut inner = self.lock();
        f(&mut SvFields(&mut inner))
    }

    /// Increments the stats counters under `sv_lock`.
    pub fn record_tx(&self, bytes: u64) {
        let mut inner = self.lock();
        inner.stats.tx_pdus += 1;
        inner.stats.tx_bytes += bytes;
    }

    /// Increments the rx stats counters under `sv_lock`.
    pub fn record_rx(&self, bytes: u64) {
        let mut inner = self.lock();
        inner.stats.rx_pdus += 1;
        inner.stats.rx_bytes += bytes;
    }

    /// Increments the dropped-PDU counter.
    pub fn record_drop(&self) {
        self.lock().stats.drop_pdus += 1;
    }

    /// Increments the errored-PDU counter.
    pub fn record_err(&self) {
        self.lock().stats.err_pdus += 1;
    }

    /// Snapshot of the stats counters.
    pub fn stats(&self) -> Stats {
        self.lock().stats
    }
}

/// A guarded view over [`StateVector`]'s fields, handed to closures passed
/// to [`StateVector::with`]. Field access mirrors the `get_*`/`set_*`
/// contract of §4.1 without requiring one method per field.
pub struct SvFields<'a>(&'a mut Inner);

macro_rules! getter {
    ($name:ident: $ty:ty) => {
        #[allow(missing_docs)]
        pub fn $name(&self) -> $ty {
            self.0.$name
        }
    };
}

impl<'a> SvFields<'a> {
    getter!(seq_nr_to_send: SequenceNumber);
    getter!(max_seq_nr_sent: SequenceNumber);
    getter!(drf_flag: bool);
    getter!(window_closed: bool);
    getter!(rate_fulfiled: bool);
    getter!(rexmsn_ctrl: bool);
    getter!(window_based: bool);
    getter!(rate_based: bool);
    getter!(drf_required: bool);
    getter!(rcv_left_window_edge: SequenceNumber);
    getter!(max_seq_nr_rcv: SequenceNumber);
    getter!(mpl: Duration);
    getter!(r: Duration);
    getter!(a: Duration);
    getter!(tr: Duration);
    getter!(next_snd_ctl_seq: SequenceNumber);
    getter!(last_snd_data_ack: SequenceNumber);
    getter!(snd_lft_win: SequenceNumber);
    getter!(snd_rt_wind_edge: SequenceNumber);
    getter!(sndr_credit: u64);
    getter!(sndr_rate: u32);
    getter!(pdus_sent_in_time_unit: u32);
    getter!(rendezvous_sndr: bool);
    getter!(last_rcv_ctl_seq: SequenceNumber);
    getter!(last_rcv_data_ack: SequenceNumber);
    getter!(rcvr_credit: u64);
    getter!(rcvr_rt_wind_edge: SequenceNumber);
    getter!(rcvr_rate: u32);
    getter!(pdus_rcvd_in_time_unit: u32);
    getter!(rendezvous_rcvr: bool);
    getter!(last_time: Instant);
    getter!(time_unit: Duration);
    getter!(rtt: i64);
    getter!(srtt: i64);
    getter!(rttvar: i64);

    #[allow(missing_docs)]
    pub fn set_seq_nr_to_send(&mut self, v: SequenceNumber) {
        self.0.seq_nr_to_send = v;
    }
    #[allow(missing_docs)]
    pub fn set_max_seq_nr_sent(&mut self, v: SequenceNumber) {
        self.0.max_seq_nr_sent = v;
    }
    #[allow(missing_docs)]
    pub fn set_drf_flag(&mut self, v: bool) {
        self.0.drf_flag = v;
    }
    #[allow(missing_docs)]
    pub fn set_window_closed(&mut self, v: bool) {
        self.0.window_closed = v;
    }
    #[allow(missing_docs)]
    pub fn set_rate_fulfiled(&mut self, v: bool) {
        self.0.rate_fulfiled = v;
    }
    #[allow(missing_docs)]
    pub fn set_rexmsn_ctrl(&mut self, v: bool) {
        self.0.rexmsn_ctrl = v;
    }
    #[allow(missing_docs)]
    pub fn set_window_based(&mut self, v: bool) {
        self.0.window_based = v;
    }
    #[allow(missing_docs)]
    pub fn set_rate_based(&mut self, v: bool) {
        self.0.rate_based = v;
    }
    #[allow(missing_docs)]
    pub fn set_drf_required(&mut self, v: bool) {
        self.0.drf_required = v;
    }
    #[allow(missing_docs)]
    pub fn set_rcv_left_window_edge(&mut self, v: SequenceNumber) {
        self.0.rcv_left_window_edge = v;
    }
    #[allow(missing_docs)]
    pub fn set_max_seq_nr_rcv(&mut self, v: SequenceNumber) {
        self.0.max_seq_nr_rcv = v;
    }
    #[allow(missing_docs)]
    pub fn set_mpl(&mut self, v: Duration) {
        self.0.mpl = v;
    }
    #[allow(missing_docs)]
    pub fn set_r(&mut self, v: Duration) {
        self.0.r = v;
    }
    #[allow(missing_docs)]
    pub fn set_a(&mut self, v: Duration) {
        self.0.a = v;
    }
    #[allow(missing_docs)]
    pub fn set_tr(&mut self, v: Duration) {
        self.0.tr = v;
    }
    #[allow(missing_docs)]
    pub fn set_next_snd_ctl_seq(&mut self, v: SequenceNumber) {
        self.0.next_snd_ctl_seq = v;
    }
    #[allow(missing_docs)]
    pub fn set_last_snd_data_ack(&mut self, v: SequenceNumber) {
        self.0.last_snd_data_ack = v;
    }
    #[allow(missing_docs)]
    pub fn set_snd_lft_win(&mut self, v: SequenceNumber) {
        self.0.snd_lft_win = v;
    }
    #[allow(missing_docs)]
    pub fn set_snd_rt_wind_edge(&mut self, v: SequenceNumber) {
        self.0.snd_rt_wind_edge = v;
    }
    #[allow(missing_docs)]
    pub fn set_sndr_credit(&mut self, v: u64) {
        self.0.sndr_credit = v;
    }
    #[allow(missing_docs)]
    pub fn set_sndr_rate(&mut self, v: u32) {
        self.0.sndr_rate = v;
    }
    #[allow(missing_docs)]
    pub fn set_pdus_sent_in_time_unit(&mut self, v: u32) {
        self.0.pdus_sent_in_time_unit = v;
    }
    #[allow(missing_docs)]
    pub fn set_rendezvous_sndr(&mut self, v: bool) {
        self.0.rendezvous_sndr = v;
    }
    #[allow(missing_docs)]
    pub fn set_last_rcv_ctl_seq(&mut self, v: SequenceNumber) {
        self.0.last_rcv_ctl_seq = v;
    }
    #[allow(missing_docs)]
    pub fn set_last_rcv_data_ack(&mut self, v: SequenceNumber) {
        self.0.last_rcv_data_ack = v;
    }
    #[allow(missing_docs)]
    pub fn set_rcvr_credit(&mut self, v: u64) {
        self.0.rcvr_credit = v;
    }
    #[allow(missing_docs)]
    pub fn set_rcvr_rt_wind_edge(&mut self, v: SequenceNumber) {
        self.0.rcvr_rt_wind_edge = v;
    }
    #[allow(missing_docs)]
    pub fn set_rcvr_rate(&mut self, v: u32) {
        self.0.rcvr_rate = v;
    }
    #[allow(missing_docs)]
    pub fn set_pdus_rcvd_in_time_unit(&mut self, v: u32) {
        self.0.pdus_rcvd_in_time_unit = v;
    }
    #[allow(missing_docs)]
    pub fn set_rendezvous_rcvr(&mut self, v: bool) {
        self.0.rendezvous_rcvr = v;
    }
    #[allow(missing_docs)]
    pub fn set_last_time(&mut self, v: Instant) {
        self.0.last_time = v;
    }
    #[allow(missing_docs)]
    pub fn set_time_unit(&mut self, v: Duration) {
        self.0.time_unit = v;
    }
    #[allow(missing_docs)]
    pub fn set_rtt(&mut self, v: i64) {
        self.0.rtt = v;
    }
    #[allow(missing_docs)]
    pub fn set_srtt(&mut self, v: i64) {
        self.0.srtt = v;
    }
    #[allow(missing_docs)]
    pub fn set_rttvar(&mut self, v: i64) {
        self.0.rttvar = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StateVectorConfig {
        StateVectorConfig {
            initial_seq_num: 10,
            mpl: Duration::from_millis(1000),
            r: Duration::from_millis(100),
            a: Duration::from_millis(200),
            initial_tr: Duration::from_millis(300),
            window_based: true,
            rate_based: false,
            rexmsn_ctrl: true,
            initial_credit: 50,
            rcvr_credit: 20,
            time_unit: Duration::from_millis(1000),
        }
    }

    #[test]
    fn next_send_seq_increments() {
        let sv = StateVector::new(config());
        assert_eq!(sv.next_send_seq(), 11);
        assert_eq!(sv.next_send_seq(), 12);
    }

    #[test]
    fn update_rt_wind_edge_never_shrinks() {
        let sv = StateVector::new(config());
        sv.with(|f| f.set_rcv_left_window_edge(100));
        sv.update_rt_wind_edge();
        assert_eq!(sv.with(|f| f.rcvr_rt_wind_edge()), 120);
        sv.with(|f| f.set_rcvr_credit(0));
        sv.update_rt_wind_edge();
        // Credit dropped to 0 but LWE unchanged: edge must not shrink.
        assert_eq!(sv.with(|f| f.rcvr_rt_wind_edge()), 120);
    }

    #[test]
    fn update_credit_and_rt_wind_edge_bumps_when_larger() {
        let sv = StateVector::new(config());
        sv.with(|f| f.set_rcv_left_window_edge(10));
        sv.update_credit_and_rt_wind_edge(100);
        assert_eq!(sv.with(|f| f.rcvr_rt_wind_edge()), 110);
    }

    #[test]
    fn stats_accumulate() {
        let sv = StateVector::new(config());
        sv.record_tx(100);
        sv.record_tx(50);
        sv.record_rx(10);
        sv.record_drop();
        sv.record_err();
        let stats = sv.stats();
        assert_eq!(stats.tx_pdus, 2);
        assert_eq!(stats.tx_bytes, 150);
        assert_eq!(stats.rx_pdus, 1);
        assert_eq!(stats.rx_bytes, 10);
        assert_eq!(stats.drop_pdus, 1);
        assert_eq!(stats.err_pdus, 1);
    }
}
