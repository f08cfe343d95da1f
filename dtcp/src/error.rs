//! Error kinds raised by the control path (§7).
use dtp::SequenceNumber;
use failure::Fail;

/// Errors raised by `Dtcp`'s control-PDU handling.
#[derive(Debug, Fail)]
pub enum DtcpError {
    /// An incoming control PDU's ack/nack sequence number has no matching
    /// RTXQ/RTTQ entry (already acked, or never sent).
    #[fail(display = "control pdu referenced unknown sequence {}", _0)]
    UnknownSequence(SequenceNumber),
    /// Forwarding a retransmission or control PDU downward failed.
    #[fail(display = "downstream send failed")]
    Downstream,
}
