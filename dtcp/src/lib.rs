//! # Data Transfer Control Protocol
//!
//! The control-plane sibling of `dtp`: builds and dispatches ACK/NACK/FC/
//! RENDEZVOUS/CONTROL_ACK control PDUs, drives the retransmission and
//! rendezvous timers, and estimates RTT from RTXQ/RTTQ timestamps. Reaches
//! into `dtp` only through its public types and the [`dtp::FlowControl`]
//! trait this crate implements, never the other way around.
#![deny(missing_docs)]
mod config;
mod error;
mod policy;
mod rtt;

pub use crate::config::{DtcpConfig, FlowControlConfig, RateConfig, RtxControlConfig, WindowConfig};
pub use crate::error::DtcpError;
pub use crate::policy::{ControlPduChoice, DefaultDtcpPolicySet, DtcpPolicySet, LostControlPdu};
pub use crate::rtt::RttEstimator;

use async_trait::async_trait;
use dtp::{ConnectionId, EfcpUpcall, Pci, Pdu, PduType, Rmt, RmtEfcpSink, SequenceNumber, SharedState, Timer};
use log::{debug, warn};
use std::io::Result as IoResult;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

struct DtcpCtx<P> {
    id: ConnectionId,
    config: DtcpConfig,
    shared: Arc<SharedState>,
    rmt: Arc<dyn Rmt>,
    efcp: Arc<dyn EfcpUpcall>,
    policy: P,
    rtt: Mutex<RttEstimator>,
    alive: Arc<AtomicBool>,
}

impl<P> DtcpCtx<P> {
    fn next_ctl_seq(&self) -> SequenceNumber {
        self.shared.sv.with(|f| {
            let n = f.next_snd_ctl_seq() + 1;
            f.set_next_snd_ctl_seq(n);
            n
        })
    }

    fn base_control_pci(&self, pdu_type: PduType) -> Pci {
        Pci {
            pdu_type,
            flags: 0,
            source: self.id.source_address,
            destination: self.id.destination_address,
            source_cep_id: self.id.source_cep_id,
            destination_cep_id: self.id.destination_cep_id,
            qos_id: self.id.qos_id,
            sequence_number: self.next_ctl_seq(),
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

    async fn send_control(&self, pci: Pci) {
        let pdu = Pdu::new(pci, bytes::Bytes::new());
        if self.rmt.send(pdu).await.is_err() {
            warn!("failed to send control pdu on port {:?}", self.id.port_id);
        }
    }

    /// Drains the CWQ now that `snd_rt_wind_edge`/`sndr_rate` may have moved
    /// (§4.8 FC/ACK_AND_FC/NACK_AND_FC handlers: "drain CWQ"). Routes through
    /// a loopback-aware sink so a drained PDU on a loopback connection is
    /// delivered the same way the direct-write fast path delivers it (§11).
    async fn drain_cwq(&self, window_based: bool, rate_based: bool, rexmsn_ctrl: bool, reconcile: impl Fn() -> bool) {
        let sink = RmtEfcpSink::new(self.rmt.clone(), self.efcp.clone(), self.id.is_loopback());
        if let Err(e) = self
            .shared
            .cwq
            .deliver(&self.shared.sv, &self.shared.rtxq, &self.shared.rttq, &sink, window_based, rate_based, rexmsn_ctrl, reconcile)
            .await
        {
            warn!("cwq drain failed on port {:?}: {}", self.id.port_id, e);
        }
    }

    /// Builds and sends the ACK/FC/AckAndFc update appropriate for the
    /// current policy choice, reflecting the receiver's current window/rate
    /// state (§4.9).
    async fn send_flow_update(&self, choice: ControlPduChoice) {
        self.shared.sv.update_rt_wind_edge();
        let (lwe, rt_edge, rate) = self.shared.sv.with(|f| (f.rcv_left_window_edge(), f.rcvr_rt_wind_edge(), f.rcvr_rate()));
        let pdu_type = match choice {
            ControlPduChoice::Ack => PduType::Ack,
            ControlPduChoice::AckAndFc => PduType::AckAndFc,
            ControlPduChoice::Fc => PduType::Fc,
        };
        let mut pci = self.base_control_pci(pdu_type);
        pci.ack_nack_seq_num = lwe;
        pci.new_rt_wind_edge = rt_edge;
        pci.sndr_rate = rate;
        self.shared.sv.with(|f| f.set_last_rcv_data_ack(lwe));
        self.send_control(pci).await;
    }
}

/// The per-connection Data Transfer Control Protocol engine.
pub struct Dtcp<P = DefaultDtcpPolicySet> {
    ctx: Arc<DtcpCtx<P>>,
    rtx_timer: Timer,
    rendezvous_timer: Timer,
}

impl Dtcp<DefaultDtcpPolicySet> {
    /// Constructs a new engine with the default policy set (§6 `dtcp_create`).
    pub fn new(id: ConnectionId, config: DtcpConfig, shared: Arc<SharedState>, rmt: Arc<dyn Rmt>, efcp: Arc<dyn EfcpUpcall>) -> Self {
        Self::with_policy(id, config, shared, rmt, efcp, DefaultDtcpPolicySet)
    }
}

impl<P> Dtcp<P>
where
    P: DtcpPolicySet + Clone + Send + Sync + 'static,
{
    /// Constructs a new engine with an explicit policy set, sharing `shared`
    /// with the DTP engine built from the same connection setup.
    pub fn with_policy(id: ConnectionId, config: DtcpConfig, shared: Arc<SharedState>, rmt: Arc<dyn Rmt>, efcp: Arc<dyn EfcpUpcall>, policy: P) -> Self {
        Self {
            ctx: Arc::new(DtcpCtx {
                id,
                config,
                shared,
                rmt,
                efcp,
                policy,
                rtt: Mutex::new(RttEstimator::new()),
                alive: Arc::new(AtomicBool::new(true)),
            }),
            rtx_timer: Timer::new(),
            rendezvous_timer: Timer::new(),
        }
    }

    /// Samples one RTT observation against the current `A` bound, feeding
    /// the estimator and writing `rtt`/`srtt`/`rttvar`/`tr` back to the state
    /// vector (§4.10).
    fn sample_rtt(&self, elapsed: std::time::Duration) {
        let a = self.ctx.shared.sv.with(|f| f.a());
        let mut rtt = self.ctx.rtt.lock().unwrap();
        let tr = rtt.sample(elapsed.as_millis() as i64, a);
        self.ctx.shared.sv.with(|f| {
            f.set_rtt(rtt.rtt());
            f.set_srtt(rtt.srtt());
            f.set_rttvar(rtt.rttvar());
            f.set_tr(tr);
        });
    }

    /// Arms (or re-arms) the RTX timer for the next `tr` interval.
    fn arm_rtx_timer(&self) {
        if self.ctx.shared.rtxq.is_empty() {
            return;
        }
        let tr = self.ctx.shared.sv.with(|f| f.tr());
        let ctx = self.ctx.clone();
        self.rtx_timer.arm(tr, move || rtx_timer_fire(ctx));
    }

    /// Arms (or re-arms) the rendezvous timer for the next `tr` interval.
    fn arm_rendezvous_timer(&self) {
        let tr = self.ctx.shared.sv.with(|f| f.tr());
        let ctx = self.ctx.clone();
        self.rendezvous_timer.arm(tr, move || rendezvous_timer_fire(ctx));
    }

    /// Re-arms the RTX timer if the RTXQ still holds work after a drain,
    /// otherwise stops it. `arm_rtx_timer` already no-ops on an empty RTXQ,
    /// but the explicit stop here also cancels any outstanding countdown
    /// rather than just declining to renew it.
    fn rtx_timer_after_drain(&self) {
        if self.ctx.shared.rtxq.is_empty() {
            self.rtx_timer.stop();
        } else {
            self.arm_rtx_timer();
        }
    }

    /// Stops all timers. The shared queues are owned and flushed by the
    /// sibling `Dtp::destroy`.
    pub fn destroy(&self) {
        self.ctx.alive.store(false, Ordering::SeqCst);
        self.rtx_timer.stop();
        self.rendezvous_timer.stop();
        debug!("dtcp connection on port {} destroyed", self.ctx.id.port_id);
    }

    /// Current RTT estimate, in milliseconds (observability, §6).
    pub fn rtt(&self) -> i64 {
        self.ctx.rtt.lock().unwrap().rtt()
    }
}

#[async_trait]
impl<P> dtp::FlowControl for Dtcp<P>
where
    P: DtcpPolicySet + Clone + Send + Sync + 'static,
{
    fn is_present(&self) -> bool {
        self.ctx.config.flow_control.is_some() || self.ctx.config.rtx_control.is_some()
    }

    fn window_based(&self) -> bool {
        self.ctx.config.window_based()
    }

    fn rate_based(&self) -> bool {
        self.ctx.config.rate_based()
    }

    fn rexmsn_ctrl(&self) -> bool {
        self.ctx.config.rexmsn_ctrl()
    }

    async fn sv_update(&self, last_pci: &Pci) {
        let choice = self.ctx.policy.pdu_ctrl_type_get(self.window_based() || self.rate_based(), self.rexmsn_ctrl());
        if let Some(choice) = choice {
            self.ctx.send_flow_update(choice).await;
        }
        let _ = last_pci;
    }

    async fn common_rcv_control(&self, pdu: Pdu) -> IoResult<()> {
        let pci = pdu.pci;
        match pci.pdu_type {
            PduType::Ack | PduType::AckAndFc => {
                self.handle_ack(&pci).await;
            }
            PduType::Nack | PduType::NackAndFc => {
                self.handle_nack(&pci).await;
            }
            PduType::Fc => {
                self.ctx.shared.sv.with(|f| f.set_snd_rt_wind_edge(pci.new_rt_wind_edge));
                self.ctx.drain_cwq(self.window_based(), self.rate_based(), self.rexmsn_ctrl(), || true).await;
                self.rtx_timer_after_drain();
            }
            PduType::Rendezvous => {
                self.ctx.shared.sv.with(|f| f.set_rendezvous_rcvr(true));
                let choice = self
                    .ctx
                    .policy
                    .pdu_ctrl_type_get(self.window_based() || self.rate_based(), self.rexmsn_ctrl())
                    .unwrap_or(ControlPduChoice::Ack);
                self.ctx.send_flow_update(choice).await;
                let mut ack = self.ctx.base_control_pci(PduType::ControlAck);
                ack.ack_nack_seq_num = pci.sequence_number;
                self.ctx.send_control(ack).await;
            }
            PduType::ControlAck => {
                self.ctx.shared.sv.with(|f| f.set_rendezvous_sndr(false));
                self.rendezvous_timer.stop();
            }
            PduType::SelAck | PduType::Dt | PduType::Mgmt => {}
        }
        if pci.pdu_type.is_control() && pci.sequence_number != 0 {
            let last = self.ctx.shared.sv.with(|f| f.last_rcv_ctl_seq());
            if pci.sequence_number > last + 1 {
                self.ctx.policy.lost_control_pdu(last, pci.sequence_number);
            }
            self.ctx.shared.sv.with(|f| f.set_last_rcv_ctl_seq(pci.sequence_number.max(last)));
        }
        Ok(())
    }

    fn note_rtx_enqueued(&self) {
        self.arm_rtx_timer();
    }

    async fn enter_rendezvous(&self) {
        self.ctx.shared.sv.with(|f| f.set_rendezvous_sndr(true));
        let credit = self.ctx.shared.sv.with(|f| f.sndr_credit());
        let snd_lft_win = self.ctx.shared.sv.with(|f| f.snd_lft_win());
        let mut pci = self.ctx.base_control_pci(PduType::Rendezvous);
        pci.new_rt_wind_edge = snd_lft_win + credit;
        pci.ack_nack_seq_num = snd_lft_win;
        self.ctx.send_control(pci).await;
        self.arm_rendezvous_timer();
    }
}

impl<P> Dtcp<P>
where
    P: DtcpPolicySet + Clone + Send + Sync + 'static,
{
    async fn handle_ack(&self, pci: &Pci) {
        let seq = pci.ack_nack_seq_num;
        if self.rexmsn_ctrl_bound() {
            if let Ok(Some(sent_at)) = self.ctx.shared.rtxq.timestamp(seq) {
                self.sample_rtt(sent_at.elapsed());
            }
            self.ctx.shared.rtxq.ack(seq);
        } else {
            if let Ok(sent_at) = self.ctx.shared.rttq.timestamp(seq) {
                self.sample_rtt(sent_at.elapsed());
            }
            self.ctx.shared.rttq.drop_acked(seq);
        }
        // §4.8 ACK handler / P4: snd_lft_win becomes seq+1 regardless of
        // whatever a later write() call does with it.
        self.ctx.shared.sv.with(|f| {
            if seq + 1 > f.snd_lft_win() {
                f.set_snd_lft_win(seq + 1);
            }
        });
        if pci.pdu_type == PduType::AckAndFc {
            self.ctx.shared.sv.with(|f| f.set_snd_rt_wind_edge(pci.new_rt_wind_edge));
            self.ctx
                .drain_cwq(self.ctx.config.window_based(), self.ctx.config.rate_based(), self.ctx.config.rexmsn_ctrl(), || true)
                .await;
        }
        self.ctx.shared.sv.with(|f| f.set_last_snd_data_ack(seq));
        self.rtx_timer_after_drain();
    }

    async fn handle_nack(&self, pci: &Pci) {
        let outcome = self.ctx.shared.rtxq.nack(pci.ack_nack_seq_num, &self.ctx.shared.sv, self.ctx.config.rate_based());
        if pci.pdu_type == PduType::NackAndFc {
            self.ctx.shared.sv.with(|f| f.set_snd_rt_wind_edge(pci.new_rt_wind_edge));
            self.ctx
                .drain_cwq(self.ctx.config.window_based(), self.ctx.config.rate_based(), self.ctx.config.rexmsn_ctrl(), || true)
                .await;
        }
        if !outcome.dropped.is_empty() {
            self.ctx.shared.sv.record_drop();
            self.advance_lft_win_over_drops(&outcome.dropped);
        }
        for retransmit in outcome.retransmits {
            if self.ctx.rmt.send(retransmit.pdu).await.is_ok() {
                self.ctx.shared.sv.record_tx(0);
            }
        }
        enter_rendezvous_if_drained(&self.ctx).await;
        self.arm_rtx_timer();
    }

    /// A dropped RTXQ entry (retries exhausted) will never be acked; move
    /// `snd_lft_win` past it so the window invariant (RTXQ invariant 3, §3)
    /// keeps holding (§4.3 "Sender-rendezvous interaction").
    fn advance_lft_win_over_drops(&self, dropped: &[SequenceNumber]) {
        if let Some(&highest) = dropped.iter().max() {
            self.ctx.shared.sv.with(|f| {
                if highest + 1 > f.snd_lft_win() {
                    f.set_snd_lft_win(highest + 1);
                }
            });
        }
    }

    fn rexmsn_ctrl_bound(&self) -> bool {
        self.ctx.config.rexmsn_ctrl()
    }
}

/// RTX timer handler (§4.3): walks the RTXQ for entries past their backoff
/// deadline, retransmits or drops them, and re-arms while work remains.
async fn rtx_timer_fire<P: Send + Sync + 'static>(ctx: Arc<DtcpCtx<P>>) {
    let tr = ctx.shared.sv.with(|f| f.tr());
    let outcome = ctx.shared.rtxq.due(tr, &ctx.shared.sv, ctx.config.rate_based());
    if !outcome.dropped.is_empty() {
        ctx.shared.sv.record_drop();
        if let Some(&highest) = outcome.dropped.iter().max() {
            ctx.shared.sv.with(|f| {
                if highest + 1 > f.snd_lft_win() {
                    f.set_snd_lft_win(highest + 1);
                }
            });
        }
    }
    for retransmit in outcome.retransmits {
        if ctx.rmt.send(retransmit.pdu).await.is_ok() {
            ctx.shared.sv.record_tx(0);
        }
    }
    enter_rendezvous_if_drained(&ctx).await;
    if ctx.shared.rtxq.is_empty() || !ctx.alive.load(Ordering::SeqCst) {
        return;
    }
    let next = ctx.clone();
    async_std::task::spawn(async move {
        futures_timer::Delay::new(tr).await;
        rtx_timer_fire(next).await;
    });
}

/// After an RTX run empties the RTXQ while the CWQ still holds PDUs, the
/// sender has nothing further it may transmit until credit reopens: advance
/// `snd_lft_win` to the highest sequence number still outstanding and enter
/// rendezvous (§4.3). Shared by the NACK-driven and timer-driven RTX paths
/// since both can be the one to drain the RTXQ.
async fn enter_rendezvous_if_drained<P: Send + Sync + 'static>(ctx: &Arc<DtcpCtx<P>>) {
    if !ctx.shared.rtxq.is_empty() || ctx.shared.cwq.is_empty() {
        return;
    }
    let highest = ctx.shared.sv.with(|f| f.max_seq_nr_sent());
    ctx.shared.sv.with(|f| f.set_snd_lft_win(highest));
    let already = ctx.shared.sv.with(|f| f.rendezvous_sndr());
    if !already {
        enter_rendezvous_ctx(ctx).await;
    }
}

/// Sends the RENDEZVOUS control PDU and starts the self-rearming rendezvous
/// timer loop, operating on a bare `DtcpCtx` so the timer-driven RTX path
/// (a free function with no access to `Dtcp`'s `Timer` fields) can enter
/// rendezvous the same way `Dtcp::enter_rendezvous` does.
async fn enter_rendezvous_ctx<P: Send + Sync + 'static>(ctx: &Arc<DtcpCtx<P>>) {
    ctx.shared.sv.with(|f| f.set_rendezvous_sndr(true));
    let credit = ctx.shared.sv.with(|f| f.sndr_credit());
    let snd_lft_win = ctx.shared.sv.with(|f| f.snd_lft_win());
    let mut pci = ctx.base_control_pci(PduType::Rendezvous);
    pci.new_rt_wind_edge = snd_lft_win + credit;
    pci.ack_nack_seq_num = snd_lft_win;
    ctx.send_control(pci).await;
    let tr = ctx.shared.sv.with(|f| f.tr());
    let next = ctx.clone();
    async_std::task::spawn(async move {
        futures_timer::Delay::new(tr).await;
        rendezvous_timer_fire(next).await;
    });
}

/// Rendezvous timer handler (§4.11): re-emits the RENDEZVOUS control PDU
/// every `tr` while the sender remains stuck in the zero-window state.
async fn rendezvous_timer_fire<P: Send + Sync + 'static>(ctx: Arc<DtcpCtx<P>>) {
    if !ctx.shared.sv.with(|f| f.rendezvous_sndr()) || !ctx.alive.load(Ordering::SeqCst) {
        return;
    }
    let credit = ctx.shared.sv.with(|f| f.sndr_credit());
    let snd_lft_win = ctx.shared.sv.with(|f| f.snd_lft_win());
    let mut pci = ctx.base_control_pci(PduType::Rendezvous);
    pci.new_rt_wind_edge = snd_lft_win + credit;
    pci.ack_nack_seq_num = snd_lft_win;
    ctx.send_control(pci).await;
    let tr = ctx.shared.sv.with(|f| f.tr());
    let next = ctx.clone();
    async_std::task::spawn(async move {
        futures_timer::Delay::new(tr).await;
        rendezvous_timer_fire(next).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use dtp::{Address, ConnectionId as Cid, DtpConfig, FlowControl, SharedState};
    use std::sync::Mutex as StdMutex;

    struct RecordingRmt {
        sent: StdMutex<Vec<Pdu>>,
    }

    #[async_trait]
    impl Rmt for RecordingRmt {
        async fn send(&self, pdu: Pdu) -> IoResult<()> {
            self.sent.lock().unwrap().push(pdu);
            Ok(())
        }
    }

    struct NullUpcall;

    #[async_trait]
    impl EfcpUpcall for NullUpcall {
        async fn post(&self, _payload: bytes::Bytes) {}
        async fn deliver_loopback(&self, _pdu: Pdu) {}
        fn enable_write(&self) {}
        fn disable_write(&self) {}
    }

    fn addr(port: u16) -> Address {
        format!("/ip4/127.0.0.1/udp/{}", port).parse().unwrap()
    }

    fn connection_id() -> Cid {
        Cid {
            source_address: addr(1000),
            destination_address: addr(2000),
            source_cep_id: 1,
            destination_cep_id: 2,
            qos_id: 0,
            port_id: 7,
        }
    }

    fn shared() -> Arc<SharedState> {
        Arc::new(SharedState::new(&DtpConfig::default(), 0, true, false, true))
    }

    #[test]
    fn pdu_ctrl_type_choice_matches_default_policy_table() {
        let p = DefaultDtcpPolicySet;
        assert_eq!(p.pdu_ctrl_type_get(true, true), Some(ControlPduChoice::AckAndFc));
        assert_eq!(p.pdu_ctrl_type_get(false, true), Some(ControlPduChoice::Ack));
        assert_eq!(p.pdu_ctrl_type_get(true, false), Some(ControlPduChoice::Fc));
        assert_eq!(p.pdu_ctrl_type_get(false, false), None);
    }

    #[test]
    fn ack_drains_rtxq_and_unblocks_rtx_timer() {
        async_std::task::block_on(async {
            let rmt = Arc::new(RecordingRmt { sent: StdMutex::new(Vec::new()) });
            let shared = shared();
            let dtcp = Dtcp::new(connection_id(), DtcpConfig::default(), shared.clone(), rmt.clone(), Arc::new(NullUpcall));
            let mut data_pci = dtcp.ctx.base_control_pci(PduType::Dt);
            data_pci.pdu_type = PduType::Dt;
            data_pci.sequence_number = 1;
            shared.rtxq.push(Pdu::new(data_pci, bytes::Bytes::new())).unwrap();
            assert!(!shared.rtxq.is_empty());

            let mut ack_pci = dtcp.ctx.base_control_pci(PduType::Ack);
            ack_pci.ack_nack_seq_num = 1;
            dtcp.common_rcv_control(Pdu::new(ack_pci, bytes::Bytes::new())).await.unwrap();
            assert!(shared.rtxq.is_empty());
            assert_eq!(shared.sv.with(|f| f.snd_lft_win()), 2);
        });
    }

    #[test]
    fn rendezvous_reply_carries_control_ack() {
        async_std::task::block_on(async {
            let rmt = Arc::new(RecordingRmt { sent: StdMutex::new(Vec::new()) });
            let shared = shared();
            let dtcp = Dtcp::new(connection_id(), DtcpConfig::default(), shared, rmt.clone(), Arc::new(NullUpcall));
            let pci = dtcp.ctx.base_control_pci(PduType::Rendezvous);
            dtcp.common_rcv_control(Pdu::new(pci, bytes::Bytes::new())).await.unwrap();
            let sent = rmt.sent.lock().unwrap();
            assert!(sent.iter().any(|p| p.pci.pdu_type == PduType::ControlAck));
        });
    }
}
