//! # Data Transfer Protocol
//!
//! Implements the DTP sender/receiver path of a RINA Data Transfer and Data
//! Transfer Control Protocol engine: sequencing, in-order reassembly, the
//! closed-window and retransmission queues, and the timers that drive
//! sender/receiver inactivity recovery. The DTCP control plane lives in the
//! sibling `dtcp` crate and reaches into this one only through the
//! [`policy::FlowControl`] trait, so this crate never depends on `dtcp`.
#![deny(missing_docs)]
mod constants;
mod cwq;
mod dtp;
mod error;
mod pci;
mod pdu;
mod policy;
mod rttq;
mod rtxq;
mod seqq;
mod sv;
mod timer;

pub use crate::constants::{Address, CepId, DataTransferConstants, PortId, QosId, SequenceNumber};
pub use crate::cwq::Cwq;
pub use crate::dtp::{ConnectionId, Dtp, DtpConfig, SharedState};
pub use crate::error::DtpError;
pub use crate::pci::{flags, Pci, PciError, PduType};
pub use crate::pdu::Pdu;
pub use crate::policy::{
    DefaultDtpPolicySet, DtpPolicySet, EfcpUpcall, FlowControl, InitialSequenceNumber, PduSink, ReconcileFlowConflict, Rmt, RmtEfcpSink,
};
pub use crate::rttq::Rttq;
pub use crate::rtxq::{backoff, Rtxq};
pub use crate::seqq::SeqQ;
pub use crate::sv::{StateVector, StateVectorConfig, Stats};
pub use crate::timer::{receiver_inactivity_interval, sender_inactivity_interval, Timer};
