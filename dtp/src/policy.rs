//! Policy-set capability traits and default implementations (§4, REDESIGN
//! FLAGS Design Note 4).
//!
//! Models each policy family as a Rust trait rather than a struct of
//! function pointers bound per connection, implemented by a
//! `Default*PolicySet` matching §4's default
//! semantics; alternate policy sets are just other trait implementations,
//! selectable at connection-construction time (no runtime string dispatch
//! is required to satisfy §6's `select_policy_set`, which the `efcp` crate
//! layers on top via a name → `Arc<dyn PolicySet>` registry, Design Note 3).
//!
//! Also breaks the dtp/dtcp circular dependency (Design Note 2): `dtp` never
//! depends on the `dtcp` crate. Instead it defines the [`FlowControl`] trait
//! that `dtcp::Dtcp` implements, and the [`Rmt`]/[`EfcpUpcall`] traits that
//! adapt to the external collaborators named in §6.
use crate::constants::SequenceNumber;
use crate::pci::Pci;
use crate::pdu::Pdu;
use async_trait::async_trait;
use std::io::Result as IoResult;
use std::sync::Arc;

/// The Relaying and Multiplexing Task, consumed only via `send` (§6).
#[async_trait]
pub trait Rmt: Send + Sync {
    /// Sends `pdu` downward. Takes ownership on success.
    async fn send(&self, pdu: Pdu) -> IoResult<()>;
}

/// The EFCP container, consumed for loopback delivery and write-enable
/// signalling (§6).
#[async_trait]
pub trait EfcpUpcall: Send + Sync {
    /// Delivers a reassembled SDU upward.
    async fn post(&self, payload: bytes::Bytes);
    /// Loopback delivery when `pci.source == pci.destination` (§4.3,
    /// `dt_pdu_send`'s short-circuit in `dt-utils.c`).
    async fn deliver_loopback(&self, pdu: Pdu);
    /// Re-enables the upper layer's ability to call `write`.
    fn enable_write(&self);
    /// Disables the upper layer's ability to call `write` (CWQ overrun).
    fn disable_write(&self);
}

/// Where an already-admitted data PDU goes once it leaves a queue: the
/// external `Rmt`, or — for a loopback connection — straight to the local
/// `EfcpUpcall` instead (§4.3/§11, `dt_pdu_send`'s short-circuit). Every
/// site that hands a DT PDU off after it sat in the CWQ takes one of these
/// rather than a bare `&dyn Rmt`, so draining the queue honors the same
/// loopback check the direct-write fast path already does.
#[async_trait]
pub trait PduSink: Send + Sync {
    /// Delivers `pdu` to its destination.
    async fn send(&self, pdu: Pdu) -> IoResult<()>;
}

/// The default [`PduSink`]: loops back to `efcp` when `loopback` is set,
/// otherwise hands off to `rmt`.
pub struct RmtEfcpSink {
    rmt: Arc<dyn Rmt>,
    efcp: Arc<dyn EfcpUpcall>,
    loopback: bool,
}

impl RmtEfcpSink {
    /// Builds a sink for a connection whose loopback-ness is already known
    /// (`ConnectionId::is_loopback`).
    pub fn new(rmt: Arc<dyn Rmt>, efcp: Arc<dyn EfcpUpcall>, loopback: bool) -> Self {
        Self { rmt, efcp, loopback }
    }
}

#[async_trait]
impl PduSink for RmtEfcpSink {
    async fn send(&self, pdu: Pdu) -> IoResult<()> {
        if self.loopback {
            self.efcp.deliver_loopback(pdu).await;
            return Ok(());
        }
        self.rmt.send(pdu).await
    }
}

/// The subset of DTCP behavior the DTP sender/receiver path needs, bound as
/// a trait so `dtp` never depends on the `dtcp` crate (Design Note 2).
/// `dtcp::Dtcp` implements this.
#[async_trait]
pub trait FlowControl: Send + Sync {
    /// Whether flow control is configured at all for this connection.
    fn is_present(&self) -> bool;
    /// Whether window-based flow control is active.
    fn window_based(&self) -> bool;
    /// Whether rate-based flow control is active.
    fn rate_based(&self) -> bool;
    /// Whether retransmission control is active.
    fn rexmsn_ctrl(&self) -> bool;
    /// Runs the receiver-side policy dispatch after a DT PDU is accepted
    /// (§4.9): `rcvr_flow_control`/`rate_reduction`/`receiving_flow_control`
    /// and, if RTX is on, `rcvr_ack`.
    async fn sv_update(&self, last_pci: &Pci);
    /// Routes an incoming control PDU through `common_rcv_control` (§4.8).
    async fn common_rcv_control(&self, pdu: Pdu) -> IoResult<()>;
    /// Called right after a PDU is pushed onto the RTXQ, so the owning DTCP
    /// instance can (re)arm its retransmission timer against the new entry.
    fn note_rtx_enqueued(&self);
    /// Enters (or re-enters) the sender-rendezvous state: build and send a
    /// `RENDEZVOUS` control PDU, and (re)arm the rendezvous timer so it is
    /// re-emitted every `tr` while the sender remains stuck (§4.3, §4.6 step
    /// 4, §4.11). A no-op if already in rendezvous and merely asked to
    /// re-arm is still safe to call repeatedly.
    async fn enter_rendezvous(&self);
}

/// Decides which side wins when the window-based and rate-based checks
/// disagree on whether the sender may transmit (`reconcile_flow_conflict`,
/// default always resolves to `true` per `dtp-ps-default.c`).
pub trait ReconcileFlowConflict: Send + Sync {
    /// Resolves a window-vs-rate disagreement.
    fn reconcile(&self) -> bool {
        true
    }
}

/// Chooses the initial sequence number for a new connection
/// (`default_initial_sequence_number`, random nonzero per `dtp-ps-default.c`).
pub trait InitialSequenceNumber: Send + Sync {
    /// Draws the initial sequence number.
    fn initial_seq_num(&self) -> SequenceNumber;
}

/// Default [`ReconcileFlowConflict`]/[`InitialSequenceNumber`] plus the
/// remaining DTP-side hooks named in REDESIGN FLAGS Design Note 4's
/// capability set: `transmission_control`, `closed_window`,
/// `snd_flow_control_overrun`, `receiver_inactivity_timer`,
/// `sender_inactivity_timer`.
///
/// These hooks are invoked directly by `Dtp::write`/`Dtp::receive` rather
/// than through a further trait indirection, since (unlike
/// `reconcile_flow_conflict` and `initial_seq_num`) their default behavior
/// is woven tightly into the state-vector mutations described in §4.6/§4.7
/// and alternate policy sets are expected to override the whole hook, not
/// just a leaf decision. `DtpPolicySet` groups the two leaf decisions that
/// are meaningfully pluggable in isolation.
pub trait DtpPolicySet: ReconcileFlowConflict + InitialSequenceNumber {}

/// The default policy set matching §4's prescribed semantics.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultDtpPolicySet;

impl ReconcileFlowConflict for DefaultDtpPolicySet {}

impl InitialSequenceNumber for DefaultDtpPolicySet {
    fn initial_seq_num(&self) -> SequenceNumber {
        use rand_initial_seq::random_nonzero;
        random_nonzero()
    }
}

impl DtpPolicySet for DefaultDtpPolicySet {}

/// Small helper module isolating the randomness source for initial
/// sequence numbers, mirroring `get_random_bytes` in
/// `default_initial_sequence_number` (`dtp-ps-default.c`).
mod rand_initial_seq {
    use crate::constants::SequenceNumber;
    use rand::Rng;

    /// Draws a random nonzero sequence number.
    pub fn random_nonzero() -> SequenceNumber {
        loop {
            let v: SequenceNumber = rand::thread_rng().gen();
            if v != 0 {
                return v;
            }
        }
    }
}
