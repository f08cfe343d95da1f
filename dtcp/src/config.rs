//! Recognized configuration options for a DTCP instance (§6, `DTCPConfig`).
//!
//! Builder-style config structs, widened from a handful of durations into
//! the full window/rate/rtx option sets.
use std::time::Duration;

/// Window-based flow control knobs.
#[derive(Clone, Copy, Debug)]
pub struct WindowConfig {
    /// Bound on the closed-window queue length.
    pub max_closed_winq_length: usize,
    /// Initial sender credit (right window edge offset).
    pub initial_credit: u64,
}

/// Rate-based flow control knobs.
#[derive(Clone, Copy, Debug)]
pub struct RateConfig {
    /// PDUs (or bytes, policy-defined) permitted per `time_period`.
    pub sending_rate: u32,
    /// Rate window length.
    pub time_period: Duration,
}

/// `DTCPConfig.flow_control`.
#[derive(Clone, Copy, Debug, Default)]
pub struct FlowControlConfig {
    /// Whether window-based flow control is active.
    pub window_based: bool,
    /// Window-based parameters, present iff `window_based`.
    pub window: Option<WindowConfig>,
    /// Whether rate-based flow control is active.
    pub rate_based: bool,
    /// Rate-based parameters, present iff `rate_based`.
    pub rate: Option<RateConfig>,
    /// Bytes received threshold before a flow-control update is forced.
    pub rcvd_bytes_threshold: Option<u64>,
    /// Bytes received percent threshold.
    pub rcvd_bytes_percent_threshold: Option<u8>,
    /// Buffers-received threshold.
    pub rcvd_buffers_threshold: Option<u32>,
    /// Bytes sent threshold.
    pub sent_bytes_threshold: Option<u64>,
    /// Bytes sent percent threshold.
    pub sent_bytes_percent_threshold: Option<u8>,
    /// Buffers-sent threshold.
    pub sent_buffers_threshold: Option<u32>,
}

/// `DTCPConfig.rtx_control`.
#[derive(Clone, Copy, Debug)]
pub struct RtxControlConfig {
    /// Maximum time spent retransmitting (`R`).
    pub max_time_retry: Duration,
    /// `data_retransmit_max`.
    pub data_retransmit_max: u32,
    /// Initial retransmission timeout.
    pub initial_tr: Duration,
}

impl Default for RtxControlConfig {
    fn default() -> Self {
        Self {
            max_time_retry: Duration::from_millis(100),
            data_retransmit_max: 5,
            initial_tr: Duration::from_millis(300),
        }
    }
}

/// Top-level DTCP configuration.
#[derive(Clone, Copy, Debug, Default)]
pub struct DtcpConfig {
    /// Flow control configuration, absent if DTCP provides only
    /// retransmission control.
    pub flow_control: Option<FlowControlConfig>,
    /// Retransmission control configuration, absent if DTCP provides only
    /// flow control.
    pub rtx_control: Option<RtxControlConfig>,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            max_closed_winq_length: 256,
            initial_credit: 256,
        }
    }
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            sending_rate: 1000,
            time_period: Duration::from_millis(1000),
        }
    }
}

impl DtcpConfig {
    /// Whether retransmission control is active.
    pub fn rexmsn_ctrl(&self) -> bool {
        self.rtx_control.is_some()
    }

    /// Whether window-based flow control is active.
    pub fn window_based(&self) -> bool {
        self.flow_control.map(|fc| fc.window_based).unwrap_or(false)
    }

    /// Whether rate-based flow control is active.
    pub fn rate_based(&self) -> bool {
        self.flow_control.map(|fc| fc.rate_based).unwrap_or(false)
    }
}
