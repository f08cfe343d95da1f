//! DTCP policy-set capability traits (§4.8, §4.9, REDESIGN FLAGS Design
//! Note 4), default implementations matching the default control policy
//! semantics (log-only on a lost control PDU, no NACKs emitted).

/// Logs (or otherwise handles) a gap detected in the control-PDU sequence.
pub trait LostControlPdu: Send + Sync {
    /// Invoked when `sn > last_rcv_ctl_seq + 1`.
    fn lost_control_pdu(&self, last: u64, sn: u64) {
        log::warn!("lost control pdu(s): expected {} got {}", last + 1, sn);
    }
}

/// Chooses the control-PDU type to send in response to an accepted DT PDU
/// (`pdu_ctrl_type_get`, §4.9).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ControlPduChoice {
    /// Pure ACK.
    Ack,
    /// ACK plus a flow-control update.
    AckAndFc,
    /// Pure flow-control update, no ACK (RTX control is off).
    Fc,
}

/// The DTCP-side policy hooks named in §4.8/§4.9.
pub trait DtcpPolicySet: LostControlPdu {
    /// Chooses which control PDU type to emit for an accepted DT PDU, given
    /// whether flow control and retransmission control are active.
    fn pdu_ctrl_type_get(&self, flow_control: bool, rtx_control: bool) -> Option<ControlPduChoice> {
        match (flow_control, rtx_control) {
            (true, true) => Some(ControlPduChoice::AckAndFc),
            (false, true) => Some(ControlPduChoice::Ack),
            (true, false) => Some(ControlPduChoice::Fc),
            (false, false) => None,
        }
    }
}

/// The default policy set matching §4.8/§4.9's prescribed semantics.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultDtcpPolicySet;

impl LostControlPdu for DefaultDtcpPolicySet {}
impl DtcpPolicySet for DefaultDtcpPolicySet {}
