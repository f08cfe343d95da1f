//! Error kinds raised at the connection-owning layer (§7).
use dtcp::DtcpError;
use dtp::DtpError;
use failure::Fail;

/// Errors a [`crate::Connection`] can raise.
#[derive(Debug, Fail)]
pub enum ConnectionError {
    /// Propagated from the DTP sender/receiver path.
    #[fail(display = "{}", _0)]
    Dtp(DtpError),
    /// Propagated from DTCP control-PDU handling.
    #[fail(display = "{}", _0)]
    Dtcp(DtcpError),
    /// `dtcp_common_rcv_control` called on a connection with no DTCP configured.
    #[fail(display = "connection has no dtcp instance")]
    NoDtcp,
    /// `receive` was handed a PDU type that dispatches to a missing DTCP.
    #[fail(display = "control pdu received but no dtcp instance present")]
    UnexpectedControlPdu,
    /// `select_policy_set`/`set_policy_set_param` named an unrecognized path or policy set.
    #[fail(display = "unknown policy set: path={} name={}", path, name)]
    UnknownPolicySet {
        /// The path argument (e.g. `"dtp"`/`"dtcp"`).
        path: String,
        /// The requested policy set name.
        name: String,
    },
    /// Downstream transport I/O failed.
    #[fail(display = "{}", _0)]
    Io(std::io::Error),
}

impl From<DtpError> for ConnectionError {
    fn from(err: DtpError) -> Self {
        Self::Dtp(err)
    }
}

impl From<DtcpError> for ConnectionError {
    fn from(err: DtcpError) -> Self {
        Self::Dtcp(err)
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}
