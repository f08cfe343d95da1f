//! Error kinds raised by the data transfer path (§7).
use crate::constants::SequenceNumber;
use crate::pci::PciError;
use failure::Fail;

/// Errors raised by `write`, `receive`, and the queues they drive.
#[derive(Debug, Fail)]
pub enum DtpError {
    /// A queue operation was attempted with a malformed argument.
    #[fail(display = "invalid argument: {}", _0)]
    InvalidArgument(&'static str),
    /// CWQ has reached `max_closed_winq_length`.
    #[fail(display = "closed-window queue full")]
    QueueFull,
    /// RTXQ insertion found an entry already resident for this sequence.
    #[fail(display = "duplicate sequence number in rtxq: {}", _0)]
    DuplicateSeq(SequenceNumber),
    /// A timestamp lookup found no entry for the requested sequence.
    #[fail(display = "no entry for sequence number: {}", _0)]
    NotFound(SequenceNumber),
    /// PCI construction or wire encoding failed.
    #[fail(display = "{}", _0)]
    Encoding(PciError),
    /// The RMT declined or failed to send a PDU.
    #[fail(display = "downstream send failed")]
    Downstream,
    /// An RTXQ entry exhausted `data_retransmit_max`; not surfaced to
    /// callers, only counted, but represented here so the drop path can be
    /// expressed uniformly.
    #[fail(display = "retries exhausted for sequence number: {}", _0)]
    RetriesExhausted(SequenceNumber),
}

impl From<PciError> for DtpError {
    fn from(err: PciError) -> Self {
        DtpError::Encoding(err)
    }
}
