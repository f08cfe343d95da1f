//! The DTP sender/receiver engine (§4.6, §4.7) plus the timer handlers of
//! §4.11 that belong to DTP (sender/receiver inactivity, A-timer, rate
//! window).
//!
//! `Dtp` holds an `Arc<DtpCtx<P>>` so that timer handlers (spawned tasks,
//! §4.11) can own a
//! cheap clone of everything they need without borrowing `Dtp` itself
//! (Design Note 7: timers carry engine identity as payload rather than a
//! self-pointer). The sibling DTCP engine (in the `dtcp` crate) is reached
//! only through the [`FlowControl`] trait object, so `dtp` never depends on
//! the `dtcp` crate (Design Note 2/4).
use crate::constants::{Address, CepId, QosId, SequenceNumber};
use crate::cwq::Cwq;
use crate::error::DtpError;
use crate::pci::{flags, Pci, PduType};
use crate::pdu::Pdu;
use crate::policy::{DtpPolicySet, EfcpUpcall, FlowControl, PduSink, Rmt, RmtEfcpSink};
use crate::rttq::Rttq;
use crate::rtxq::Rtxq;
use crate::seqq::SeqQ;
use crate::sv::{StateVector, StateVectorConfig};
use crate::timer::{receiver_inactivity_interval, sender_inactivity_interval, Timer};
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Recognized options for a DTP instance (§6, `DTPConfig`).
#[derive(Clone, Copy, Debug)]
pub struct DtpConfig {
    /// Whether a DTCP instance backs this connection.
    pub dtcp_present: bool,
    /// Sequence number value past which a rollover warning/policy fires.
    /// Sequence numbers never actually wrap; this only bounds when to warn.
    pub seq_num_rollover_threshold: SequenceNumber,
    /// Whether partial SDU delivery is permitted.
    pub partial_delivery: bool,
    /// Whether incomplete SDUs may be delivered on teardown.
    pub incomplete_delivery: bool,
    /// Whether in-order delivery is required.
    pub in_order_delivery: bool,
    /// Maximum acceptable gap in sequence numbers before treating a PDU as
    /// an overrun rather than reorderable.
    pub max_sdu_gap: u64,
    /// Bound on the closed-window queue length.
    pub max_closed_winq_length: usize,
    /// `data_retransmit_max` for the RTXQ.
    pub data_retransmit_max: u32,
    /// Maximum PDU lifetime.
    pub mpl: Duration,
    /// Maximum retransmission time.
    pub r: Duration,
    /// Delayed-ack/reassembly bound.
    pub a: Duration,
    /// Initial retransmission timeout.
    pub initial_tr: Duration,
    /// Initial sender credit.
    pub initial_credit: u64,
    /// Initial receiver credit.
    pub rcvr_credit: u64,
    /// Rate window length.
    pub time_unit: Duration,
}

impl Default for DtpConfig {
    fn default() -> Self {
        Self {
            dtcp_present: false,
            seq_num_rollover_threshold: SequenceNumber::max_value() - 1,
            partial_delivery: false,
            incomplete_delivery: false,
            in_order_delivery: true,
            max_sdu_gap: 0,
            max_closed_winq_length: 256,
            data_retransmit_max: 5,
            mpl: Duration::from_millis(1000),
            r: Duration::from_millis(100),
            a: Duration::from_millis(0),
            initial_tr: Duration::from_millis(300),
            initial_credit: 256,
            rcvr_credit: 256,
            time_unit: Duration::from_millis(1000),
        }
    }
}

/// Identifies the connection this engine instance belongs to (§3).
#[derive(Clone, Copy, Debug)]
pub struct ConnectionId {
    /// Source process address.
    pub source_address: Address,
    /// Destination process address.
    pub destination_address: Address,
    /// Source connection-endpoint id.
    pub source_cep_id: CepId,
    /// Destination connection-endpoint id.
    pub destination_cep_id: CepId,
    /// Quality-of-service class.
    pub qos_id: QosId,
    /// Local handle exposed to the upper layer.
    pub port_id: u32,
}

impl ConnectionId {
    /// Whether `source_address`/`destination_address` resolve to the same
    /// socket, meaning PDUs for this connection loop back locally instead
    /// of going out over `Rmt` (§11 `dt_pdu_send`).
    pub fn is_loopback(&self) -> bool {
        self.source_address.socket_addr() == self.destination_address.socket_addr()
    }
}

/// The state a DTP and its sibling DTCP engine share for one connection:
/// the state vector and the four queues (§3's "single per-connection lock
/// plus queue locks" model). Constructed once per connection and handed to
/// both engines as an `Arc`.
pub struct SharedState {
    /// The per-connection state vector.
    pub sv: StateVector,
    /// Closed-window queue.
    pub cwq: Cwq,
    /// Retransmission queue.
    pub rtxq: Rtxq,
    /// RTT queue.
    pub rttq: Rttq,
    /// Sequencing/reassembly queue.
    pub seqq: SeqQ,
}

impl SharedState {
    /// Builds the shared state for a new connection (§3 lifecycle: "the SV
    /// is initialized from `DTPConfig`/`DTCPConfig`, initial seq number is
    /// drawn").
    pub fn new(config: &DtpConfig, initial_seq_num: SequenceNumber, window_based: bool, rate_based: bool, rexmsn_ctrl: bool) -> Self {
        Self {
            sv: StateVector::new(StateVectorConfig {
                initial_seq_num,
                mpl: config.mpl,
                r: config.r,
                a: config.a,
                initial_tr: config.initial_tr,
                window_based,
                rate_based,
                rexmsn_ctrl,
                initial_credit: config.initial_credit,
                rcvr_credit: config.rcvr_credit,
                time_unit: config.time_unit,
            }),
            cwq: Cwq::new(config.max_closed_winq_length),
            rtxq: Rtxq::new(config.data_retransmit_max),
            rttq: Rttq::new(),
            seqq: SeqQ::new(),
        }
    }
}

/// Everything a timer handler needs to act on this connection, without
/// borrowing the owning [`Dtp`]. Cloning a `Arc<DtpCtx<P>>` is cheap; timer
/// closures capture the clone instead of `&Dtp` (Design Note 7).
struct DtpCtx<P> {
    id: ConnectionId,
    config: DtpConfig,
    shared: Arc<SharedState>,
    rmt: Arc<dyn Rmt>,
    efcp: Arc<dyn EfcpUpcall>,
    dtcp: Option<Arc<dyn FlowControl>>,
    policy: P,
    // The PCI of the most recently accepted DT PDU, used by the A-timer
    // handler to re-run `dtcp.sv_update` after an expiry-driven drain (§4.5
    // step 3) when no new PDU has arrived to carry it.
    last_rx_pci: Mutex<Option<Pci>>,
    // Cleared by `Dtp::destroy`; checked by the self-rearming A-timer and
    // rate-window background loops so they stop spawning once the
    // connection is torn down instead of running forever.
    alive: Arc<AtomicBool>,
}

impl<P> DtpCtx<P> {
    fn base_pci(&self, pdu_type: PduType) -> Pci {
        Pci {
            pdu_type,
            flags: 0,
            source: self.id.source_address,
            destination: self.id.destination_address,
            source_cep_id: self.id.source_cep_id,
            destination_cep_id: self.id.destination_cep_id,
            qos_id: self.id.qos_id,
            sequence_number: 0,
            length: 0,
            ttl: 64,
            ack_nack_seq_num: 0,
            new_rt_wind_edge: 0,
            new_lf_wind_edge: 0,
            my_rt_wind_edge: 0,
            my_lf_wind_edge: 0,
            last_ctrl_seq_num_rcvd: 0,
            sndr_rate: 0,
            time_frame: 0,
        }
    }

    fn is_loopback(&self) -> bool {
        self.id.is_loopback()
    }

    async fn send_to_rmt(&self, pdu: Pdu) -> Result<(), DtpError> {
        if self.is_loopback() {
            self.efcp.deliver_loopback(pdu).await;
            return Ok(());
        }
        self.rmt.send(pdu).await.map_err(|_| DtpError::Downstream)
    }

    /// A [`PduSink`] for this connection: PDUs handed to it loop back to
    /// `efcp` instead of `rmt` under the same condition `send_to_rmt` uses,
    /// so CWQ drains get the same loopback treatment as the direct-write
    /// fast path.
    fn pdu_sink(&self) -> RmtEfcpSink {
        RmtEfcpSink::new(self.rmt.clone(), self.efcp.clone(), self.is_loopback())
    }
}

/// The per-connection Data Transfer Protocol engine.
pub struct Dtp<P = crate::policy::DefaultDtpPolicySet> {
    ctx: Arc<DtpCtx<P>>,
    sender_inactivity: Timer,
    receiver_inactivity: Timer,
    a_timer: Timer,
    rate_window: Timer,
    // Holds PDUs awaiting post while `receive` walks the SeqQ; distinct
    // from `sv_lock` since nothing else needs to observe it.
    post_buf: Mutex<Vec<Pdu>>,
}

impl Dtp<crate::policy::DefaultDtpPolicySet> {
    /// Constructs a new engine with the default policy set (§6 `dtp_create`).
    pub fn new(
        id: ConnectionId,
        config: DtpConfig,
        shared: Arc<SharedState>,
        rmt: Arc<dyn Rmt>,
        efcp: Arc<dyn EfcpUpcall>,
        dtcp: Option<Arc<dyn FlowControl>>,
    ) -> Self {
        Self::with_policy(id, config, shared, rmt, efcp, dtcp, crate::policy::DefaultDtpPolicySet)
    }
}

impl<P> Dtp<P>
where
    P: DtpPolicySet + Clone + Send + Sync + 'static,
{
    /// Constructs a new engine with an explicit policy set, sharing `shared`
    /// with the DTCP engine already built from the same connection setup.
    pub fn with_policy(
        id: ConnectionId,
        config: DtpConfig,
        shared: Arc<SharedState>,
        rmt: Arc<dyn Rmt>,
        efcp: Arc<dyn EfcpUpcall>,
        dtcp: Option<Arc<dyn FlowControl>>,
        policy: P,
    ) -> Self {
        Self {
            ctx: Arc::new(DtpCtx {
                id,
                config,
                shared,
                rmt,
                efcp,
                dtcp,
                policy,
                last_rx_pci: Mutex::new(None),
                alive: Arc::new(AtomicBool::new(true)),
            }),
            sender_inactivity: Timer::new(),
            receiver_inactivity: Timer::new(),
            a_timer: Timer::new(),
            rate_window: Timer::new(),
            post_buf: Mutex::new(Vec::new()),
        }
    }

    /// DTP sender path (§4.6).
    pub async fn write(&self, sdu: bytes::Bytes) -> Result<(), DtpError> {
        let sv = &self.ctx.shared.sv;

        // Step 1: stop the sender-inactivity timer.
        self.sender_inactivity.stop();

        // Step 2: encapsulate, assign sequence number, fill PCI, set DRF.
        let csn = sv.next_send_seq();
        let mut pci = self.ctx.base_pci(PduType::Dt);
        pci.sequence_number = csn;
        let drf = sv.with(|f| {
            let snd_lft_win = f.snd_lft_win();
            let rexmsn_ctrl = f.rexmsn_ctrl();
            f.drf_flag() || (snd_lft_win == csn - 1 && rexmsn_ctrl)
        });
        if drf {
            pci.flags |= flags::DATA_RUN;
            sv.with(|f| f.set_drf_flag(false));
        }
        let pdu = Pdu::new(pci, sdu);

        // Step 3: no DTCP -> straight to RMT.
        if self.ctx.dtcp.is_none() {
            self.ctx.send_to_rmt(pdu.duplicate()).await?;
            sv.record_tx(pdu.payload.len() as u64);
            self.arm_sender_inactivity();
            return Ok(());
        }
        let dtcp = self.ctx.dtcp.as_ref().unwrap();

        // Step 4: window/rate admission check.
        if dtcp.window_based() || dtcp.rate_based() {
            let pdu_bytes = pdu.payload.len() as u64;
            let rate_exceeded = dtcp.rate_based()
                && sv.with(|f| {
                    let rate = f.sndr_rate();
                    rate > 0 && f.pdus_sent_in_time_unit() as u64 + pdu_bytes >= rate as u64
                });
            let admitted = crate::cwq::can_deliver(sv, dtcp.window_based(), dtcp.rate_based(), rate_exceeded, || self.ctx.policy.reconcile());
            if !admitted {
                if dtcp.window_based() {
                    sv.with(|f| {
                        if f.max_seq_nr_sent() >= f.snd_rt_wind_edge() {
                            f.set_window_closed(true);
                        }
                    });
                }
                if rate_exceeded {
                    sv.with(|f| f.set_rate_fulfiled(true));
                }
                match self.ctx.shared.cwq.push(pdu.duplicate()) {
                    Ok(()) => {}
                    Err(DtpError::QueueFull) => {
                        // snd_flow_control_overrun: force-push and disable
                        // upper-layer write (default policy, §4.6 step 4).
                        self.ctx.shared.cwq.force_push(pdu.duplicate());
                        self.ctx.efcp.disable_write();
                    }
                    Err(e) => return Err(e),
                }
                let rtx_has_work = dtcp.rexmsn_ctrl() && !self.ctx.shared.rtxq.is_empty();
                if !rtx_has_work {
                    let already_in_rendezvous = sv.with(|f| f.rendezvous_sndr());
                    if !already_in_rendezvous {
                        dtcp.enter_rendezvous().await;
                    }
                }
                self.arm_sender_inactivity();
                return Ok(());
            }
        }

        // Step 5: rate accounting, mirroring `Cwq::deliver`'s drain path
        // exactly (bytes, clamped to `sndr_rate`).
        if dtcp.rate_based() {
            let pdu_bytes = pdu.payload.len() as u32;
            sv.with(|f| {
                let rate = f.sndr_rate();
                let n = f.pdus_sent_in_time_unit() + pdu_bytes;
                f.set_pdus_sent_in_time_unit(if rate > 0 { n.min(rate) } else { n });
            });
        }

        // Step 6: RTX/RTT bookkeeping.
        if dtcp.rexmsn_ctrl() {
            self.ctx.shared.rtxq.push(pdu.duplicate())?;
            dtcp.note_rtx_enqueued();
        } else {
            self.ctx.shared.rttq.push(csn);
        }

        // Step 7: transmission_control policy (default: advance
        // max_seq_nr_sent/snd_lft_win, hand to RMT).
        sv.with(|f| {
            f.set_max_seq_nr_sent(csn);
            f.set_snd_lft_win(csn);
        });
        self.ctx.send_to_rmt(pdu.duplicate()).await?;

        // Step 8: stats + re-arm sender-inactivity timer.
        sv.record_tx(pdu.payload.len() as u64);
        self.arm_sender_inactivity();
        Ok(())
    }

    /// DTP receiver path (§4.7).
    pub async fn receive(&self, pdu: Pdu) -> Result<(), DtpError> {
        let sv = &self.ctx.shared.sv;
        let seq = pdu.sequence_number();
        *self.ctx.last_rx_pci.lock().unwrap() = Some(pdu.pci);

        // Step 1: initial data run handling.
        if sv.with(|f| f.drf_required()) {
            self.arm_receiver_inactivity();
            if pdu.pci.drf() {
                sv.with(|f| {
                    f.set_drf_required(false);
                    f.set_rcv_left_window_edge(seq);
                });
                self.ctx.shared.seqq.flush();
                self.ctx.shared.rttq.flush();
                if let Some(dtcp) = &self.ctx.dtcp {
                    dtcp.sv_update(&pdu.pci).await;
                }
                let bytes = pdu.payload.len() as u64;
                self.ctx.efcp.post(pdu.payload).await;
                sv.record_rx(bytes);
                return Ok(());
            }
            sv.record_drop();
            return Ok(());
        }

        // Step 2: duplicate check.
        let lwe = sv.with(|f| f.rcv_left_window_edge());
        if seq <= lwe {
            sv.record_drop();
            return Ok(());
        }

        // Step 3: flow-control overrun check.
        if let Some(dtcp) = &self.ctx.dtcp {
            if dtcp.window_based() {
                let rcvr_rt_wind_edge = sv.with(|f| f.rcvr_rt_wind_edge());
                if seq > rcvr_rt_wind_edge {
                    sv.record_drop();
                    return Ok(());
                }
            }
        }

        // Step 4: restart receiver-inactivity timer.
        self.arm_receiver_inactivity();

        // Step 5: clear rendezvous-receiver state if set.
        let was_rendezvous = sv.with(|f| f.rendezvous_rcvr());
        if was_rendezvous {
            sv.with(|f| f.set_rendezvous_rcvr(false));
        }

        let a = sv.with(|f| f.a());
        let bytes = pdu.payload.len() as u64;

        // Step 6: no reassembly delay budget.
        if a == Duration::from_millis(0) {
            let rtx_ctrl = self.ctx.dtcp.as_ref().map(|d| d.rexmsn_ctrl()).unwrap_or(false);
            let gap_too_large = rtx_ctrl && (seq - lwe > self.ctx.config.max_sdu_gap + 1);
            if gap_too_large {
                sv.record_drop();
                return Ok(());
            }
            sv.with(|f| f.set_rcv_left_window_edge(seq));
            if let Some(dtcp) = &self.ctx.dtcp {
                dtcp.sv_update(&pdu.pci).await;
            }
            self.ctx.efcp.post(pdu.payload).await;
            sv.record_rx(bytes);
            return Ok(());
        }

        // Step 7: A-timer reassembly path.
        let mut to_post = Vec::new();
        if seq == lwe + 1 {
            sv.with(|f| f.set_rcv_left_window_edge(seq));
            to_post.push(pdu.duplicate());
            let rtx_ctrl = self.ctx.dtcp.as_ref().map(|d| d.rexmsn_ctrl()).unwrap_or(false);
            let new_lwe = sv.with(|f| f.rcv_left_window_edge());
            let drained = self.ctx.shared.seqq.drain(new_lwe, a, self.ctx.config.max_sdu_gap, rtx_ctrl);
            if let Some(edge) = drained.new_lwe {
                sv.with(|f| f.set_rcv_left_window_edge(edge));
            }
            to_post.extend(drained.to_post);
        } else {
            self.ctx.shared.seqq.insert(pdu.duplicate());
        }

        if let Some(dtcp) = &self.ctx.dtcp {
            dtcp.sv_update(&pdu.pci).await;
        }

        if self.ctx.shared.seqq.is_empty() {
            self.a_timer.stop();
        } else {
            self.arm_a_timer();
        }

        {
            let mut buf = self.post_buf.lock().unwrap();
            buf.extend(to_post);
        }
        let batch: Vec<Pdu> = self.post_buf.lock().unwrap().drain(..).collect();
        let mut posted_bytes = 0u64;
        for p in batch {
            posted_bytes += p.payload.len() as u64;
            self.ctx.efcp.post(p.payload).await;
        }
        if posted_bytes > 0 {
            sv.record_rx(posted_bytes);
        }
        Ok(())
    }

    fn arm_sender_inactivity(&self) {
        let interval = self.ctx.shared.sv.with(|f| sender_inactivity_interval(f.mpl(), f.r(), f.a()));
        let ctx = self.ctx.clone();
        self.sender_inactivity.arm(interval, move || sender_inactivity_fire(ctx));
    }

    fn arm_receiver_inactivity(&self) {
        let interval = self.ctx.shared.sv.with(|f| receiver_inactivity_interval(f.mpl(), f.r(), f.a()));
        let ctx = self.ctx.clone();
        self.receiver_inactivity.arm(interval, move || receiver_inactivity_fire(ctx));
    }

    fn arm_a_timer(&self) {
        let a = self.ctx.shared.sv.with(|f| f.a()).max(Duration::from_millis(1));
        let ctx = self.ctx.clone();
        self.a_timer.arm(a, move || a_timer_fire(ctx));
    }

    fn arm_rate_window(&self) {
        let time_unit = self.ctx.shared.sv.with(|f| f.time_unit());
        let ctx = self.ctx.clone();
        self.rate_window.arm(time_unit, move || rate_window_fire(ctx));
    }

    /// Current RTT estimate, in milliseconds (observability, §6).
    pub fn rtt(&self) -> i64 {
        self.ctx.shared.sv.with(|f| f.rtt())
    }

    /// Current smoothed RTT estimate, in milliseconds.
    pub fn srtt(&self) -> i64 {
        self.ctx.shared.sv.with(|f| f.srtt())
    }

    /// Current RTT variance estimate, in milliseconds.
    pub fn rttvar(&self) -> i64 {
        self.ctx.shared.sv.with(|f| f.rttvar())
    }

    /// CWQ length (observability).
    pub fn closed_win_q_length(&self) -> usize {
        self.ctx.shared.cwq.size()
    }

    /// RTXQ length (observability).
    pub fn rtx_q_length(&self) -> usize {
        self.ctx.shared.rtxq.size()
    }

    /// Total PDUs dropped from the RTXQ for exhausting retries.
    pub fn rtx_drop_pdus(&self) -> u64 {
        self.ctx.shared.rtxq.drop_pdus()
    }

    /// Snapshot of the stats counters (`{tx,rx,drop,err}_pdus`, `{tx,rx}_bytes`).
    pub fn stats(&self) -> crate::sv::Stats {
        self.ctx.shared.sv.stats()
    }

    /// The connection identity this engine instance serves.
    pub fn connection_id(&self) -> ConnectionId {
        self.ctx.id
    }

    /// The shared state this engine and its sibling DTCP engine operate on.
    pub fn shared(&self) -> &Arc<SharedState> {
        &self.ctx.shared
    }

    /// Kicks off (or re-arms) the rate-window timer. `write`/`Cwq::deliver`
    /// set `rate_fulfiled`; this is what reopens the window (§4.11 "Rate
    /// window" row). Called once at construction by the owning `efcp`
    /// connection when rate-based flow control is active.
    pub fn start_rate_window(&self) {
        self.arm_rate_window();
    }

    /// Destroys the connection: stop all timers first, then flush queues
    /// (§3 lifecycle, §5 cancellation semantics).
    pub fn destroy(&self) {
        self.ctx.alive.store(false, Ordering::SeqCst);
        self.sender_inactivity.stop();
        self.receiver_inactivity.stop();
        self.a_timer.stop();
        self.rate_window.stop();
        self.ctx.shared.cwq.flush();
        self.ctx.shared.rtxq.flush();
        self.ctx.shared.rttq.flush();
        self.ctx.shared.seqq.flush();
        debug!("dtp connection on port {:?} destroyed", self.ctx.id.port_id);
    }
}

/// Sender-inactivity timer handler (§4.11): `default_sender_inactivity_timer`
/// resets the sequence number, sets `drf_flag`, clears `window_closed` and
/// `rendezvous_sndr`, reinitializes the send window, and flushes RTXQ/RTTQ/
/// CWQ so a fresh data run starts clean.
async fn sender_inactivity_fire<P: DtpPolicySet>(ctx: Arc<DtpCtx<P>>) {
    debug!("sender inactivity expired on port {:?}", ctx.id.port_id);
    let new_seq = ctx.policy.initial_seq_num();
    ctx.shared.sv.with(|f| {
        f.set_seq_nr_to_send(new_seq);
        f.set_max_seq_nr_sent(new_seq);
        f.set_drf_flag(true);
        f.set_window_closed(false);
        f.set_rendezvous_sndr(false);
        f.set_snd_lft_win(new_seq);
        f.set_snd_rt_wind_edge(new_seq + f.sndr_credit());
    });
    ctx.shared.cwq.flush();
    ctx.shared.rtxq.flush();
    ctx.shared.rttq.flush();
    ctx.efcp.enable_write();
}

/// Receiver-inactivity timer handler (§4.11): resets `rcvr_rt_wind_edge` and
/// `LWE`, flushes SeqQ, and requires a fresh `DATA_RUN` on the next PDU.
async fn receiver_inactivity_fire<P>(ctx: Arc<DtpCtx<P>>) {
    debug!("receiver inactivity expired on port {:?}", ctx.id.port_id);
    ctx.shared.sv.with(|f| {
        f.set_rcv_left_window_edge(0);
        f.set_rcvr_rt_wind_edge(f.rcvr_credit());
        f.set_drf_required(true);
    });
    ctx.shared.seqq.flush();
}

/// A-timer handler (§4.5): walks SeqQ, posts whatever is deliverable, and
/// re-arms or stops depending on whether anything remains.
async fn a_timer_fire<P>(ctx: Arc<DtpCtx<P>>) {
    let lwe = ctx.shared.sv.with(|f| f.rcv_left_window_edge());
    let a = ctx.shared.sv.with(|f| f.a());
    let rtx_ctrl = ctx.dtcp.as_ref().map(|d| d.rexmsn_ctrl()).unwrap_or(false);
    let max_sdu_gap = ctx.config.max_sdu_gap;
    let drained = ctx.shared.seqq.drain(lwe, a, max_sdu_gap, rtx_ctrl);
    if let Some(edge) = drained.new_lwe {
        ctx.shared.sv.with(|f| f.set_rcv_left_window_edge(edge));
    }
    let mut posted_bytes = 0u64;
    for pdu in drained.to_post {
        posted_bytes += pdu.payload.len() as u64;
        ctx.efcp.post(pdu.payload).await;
    }
    if posted_bytes > 0 {
        ctx.shared.sv.record_rx(posted_bytes);
    }
    if let Some(dtcp) = &ctx.dtcp {
        if let Some(pci) = *ctx.last_rx_pci.lock().unwrap() {
            dtcp.sv_update(&pci).await;
        }
    }
    if ctx.shared.seqq.is_empty() || !ctx.alive.load(Ordering::SeqCst) {
        return;
    }
    // Re-arming requires access to the owning `Dtp::a_timer` handle, which
    // the context does not hold (it would create a cycle); instead the
    // timer that fired is left disarmed and `receive` re-arms it on the
    // next PDU. A standalone background re-arm loop honors §4.5 step 4
    // ("otherwise re-arm with A/AF") even with no new arrival, checking
    // `alive` each round so it stops once the connection is destroyed.
    let interval = a.max(Duration::from_millis(1));
    let next = ctx.clone();
    async_std::task::spawn(async move {
        futures_timer::Delay::new(interval).await;
        a_timer_fire(next).await;
    });
}

/// Rate-window timer handler (§4.11): zeroes the rate counters, clears
/// `rate_fulfiled`, re-enables upper-layer write, and drains the CWQ now
/// that the window has reopened.
async fn rate_window_fire<P: crate::policy::ReconcileFlowConflict>(ctx: Arc<DtpCtx<P>>) {
    let time_unit = ctx.shared.sv.with(|f| {
        f.set_pdus_sent_in_time_unit(0);
        f.set_rate_fulfiled(false);
        f.set_last_time(std::time::Instant::now());
        f.time_unit()
    });
    let (window_based, rate_based, rexmsn_ctrl) = ctx
        .dtcp
        .as_ref()
        .map(|d| (d.window_based(), d.rate_based(), d.rexmsn_ctrl()))
        .unwrap_or((false, true, false));
    let sink = ctx.pdu_sink();
    if let Err(e) = ctx
        .shared
        .cwq
        .deliver(&ctx.shared.sv, &ctx.shared.rtxq, &ctx.shared.rttq, &sink, window_based, rate_based, rexmsn_ctrl, || {
            ctx.policy.reconcile()
        })
        .await
    {
        warn!("cwq drain failed on port {:?}: {}", ctx.id.port_id, e);
    }
    // A rate-reopened drain may have pushed fresh entries onto the RTXQ
    // (rexmsn_ctrl on); re-arm its timer unconditionally so they are never
    // left with nothing to retransmit them, matching the direct-write
    // path's own `dtcp.note_rtx_enqueued()` call right after its own
    // `rtxq.push` (§4.6 step 6).
    if rexmsn_ctrl {
        if let Some(dtcp) = &ctx.dtcp {
            dtcp.note_rtx_enqueued();
        }
    }
    if ctx.shared.cwq.below_threshold() {
        ctx.efcp.enable_write();
    }
    if !ctx.alive.load(Ordering::SeqCst) {
        return;
    }
    let next = ctx.clone();
    async_std::task::spawn(async move {
        futures_timer::Delay::new(time_unit).await;
        rate_window_fire(next).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Mutex as StdMutex;

    struct RecordingRmt {
        sent: StdMutex<Vec<Pdu>>,
    }

    impl RecordingRmt {
        fn new() -> Self {
            Self { sent: StdMutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl Rmt for RecordingRmt {
        async fn send(&self, pdu: Pdu) -> std::io::Result<()> {
            self.sent.lock().unwrap().push(pdu);
            Ok(())
        }
    }

    struct RecordingUpcall {
        posted: StdMutex<Vec<Bytes>>,
        write_enabled: StdMutex<bool>,
    }

    impl RecordingUpcall {
        fn new() -> Self {
            Self {
                posted: StdMutex::new(Vec::new()),
                write_enabled: StdMutex::new(true),
            }
        }
    }

    #[async_trait]
    impl EfcpUpcall for RecordingUpcall {
        async fn post(&self, payload: Bytes) {
            self.posted.lock().unwrap().push(payload);
        }

        async fn deliver_loopback(&self, pdu: Pdu) {
            self.posted.lock().unwrap().push(pdu.payload);
        }

        fn enable_write(&self) {
            *self.write_enabled.lock().unwrap() = true;
        }

        fn disable_write(&self) {
            *self.write_enabled.lock().unwrap() = false;
        }
    }

    fn addr(port: u16) -> Address {
        format!("/ip4/127.0.0.1/udp/{}", port).parse().unwrap()
    }

    fn connection_id() -> ConnectionId {
        ConnectionId {
            source_address: addr(1000),
            destination_address: addr(2000),
            source_cep_id: 1,
            destination_cep_id: 2,
            qos_id: 0,
            port_id: 1,
        }
    }

    fn engine(config: DtpConfig) -> (Dtp, Arc<RecordingRmt>, Arc<RecordingUpcall>) {
        let rmt = Arc::new(RecordingRmt::new());
        let efcp = Arc::new(RecordingUpcall::new());
        let shared = Arc::new(SharedState::new(&config, 0, false, false, false));
        let dtp = Dtp::new(connection_id(), config, shared, rmt.clone(), efcp.clone(), None);
        (dtp, rmt, efcp)
    }

    fn data_pdu(seq: u64, drf: bool, payload: &'static [u8]) -> Pdu {
        let mut pci = Pci {
            pdu_type: PduType::Dt,
            flags: 0,
            source: addr(2000),
            destination: addr(1000),
            source_cep_id: 2,
            destination_cep_id: 1,
            qos_id: 0,
            sequence_number: seq,
            length: payload.len() as u32,
            ttl: 64,
            ack_nack_seq_num: 0,
            new_rt_wind_edge: 0,
            new_lf_wind_edge: 0,
            my_rt_wind_edge: 0,
            my_lf_wind_edge: 0,
            last_ctrl_seq_num_rcvd: 0,
            sndr_rate: 0,
            time_frame: 0,
        };
        if drf {
            pci.flags |= flags::DATA_RUN;
        }
        Pdu::new(pci, Bytes::from_static(payload))
    }

    #[test]
    fn write_without_dtcp_sends_directly_with_drf_on_first_pdu_only() {
        async_std::task::block_on(async {
            let (dtp, rmt, _efcp) = engine(DtpConfig::default());
            dtp.write(Bytes::from_static(b"one")).await.unwrap();
            dtp.write(Bytes::from_static(b"two")).await.unwrap();
            let sent = rmt.sent.lock().unwrap();
            assert_eq!(sent.len(), 2);
            assert!(sent[0].pci.drf());
            assert!(!sent[1].pci.drf());
            assert_eq!(sent[0].pci.sequence_number + 1, sent[1].pci.sequence_number);
            assert_eq!(dtp.stats().tx_pdus, 2);
        });
    }

    #[test]
    fn receive_drops_non_drf_pdu_before_data_run_starts() {
        async_std::task::block_on(async {
            let (dtp, _rmt, efcp) = engine(DtpConfig::default());
            dtp.receive(data_pdu(5, false, b"ignored")).await.unwrap();
            assert!(efcp.posted.lock().unwrap().is_empty());
            assert_eq!(dtp.stats().drop_pdus, 1);
        });
    }

    #[test]
    fn receive_accepts_drf_pdu_and_starts_data_run() {
        async_std::task::block_on(async {
            let (dtp, _rmt, efcp) = engine(DtpConfig::default());
            dtp.receive(data_pdu(5, true, b"hello")).await.unwrap();
            assert_eq!(efcp.posted.lock().unwrap().as_slice(), [Bytes::from_static(b"hello")]);
            assert_eq!(dtp.stats().rx_pdus, 1);
        });
    }

    #[test]
    fn receive_drops_duplicate_at_or_below_left_window_edge() {
        async_std::task::block_on(async {
            let (dtp, _rmt, efcp) = engine(DtpConfig::default());
            dtp.receive(data_pdu(5, true, b"first")).await.unwrap();
            dtp.receive(data_pdu(5, false, b"first")).await.unwrap();
            dtp.receive(data_pdu(3, false, b"stale")).await.unwrap();
            assert_eq!(efcp.posted.lock().unwrap().len(), 1);
            assert_eq!(dtp.stats().drop_pdus, 2);
        });
    }

    #[test]
    fn receive_reassembles_out_of_order_pdus_in_ascending_order() {
        async_std::task::block_on(async {
            let mut config = DtpConfig::default();
            config.a = Duration::from_millis(50);
            let (dtp, _rmt, efcp) = engine(config);
            dtp.receive(data_pdu(1, true, b"one")).await.unwrap();
            dtp.receive(data_pdu(3, false, b"three")).await.unwrap();
            assert_eq!(efcp.posted.lock().unwrap().len(), 1);
            dtp.receive(data_pdu(2, false, b"two")).await.unwrap();
            let posted: Vec<Bytes> = efcp.posted.lock().unwrap().clone();
            assert_eq!(posted, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two"), Bytes::from_static(b"three")]);
            assert_eq!(dtp.stats().rx_pdus, 3);
        });
    }
}
