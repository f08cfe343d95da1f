//! # Error and Flow Control Protocol connection container
//!
//! Ties one [`dtp::Dtp`] sender/receiver engine to its optional sibling
//! [`dtcp::Dtcp`] control-plane engine, sharing a single [`dtp::SharedState`]
//! between them (REDESIGN FLAGS Design Note 2: no raw back-pointers, one
//! owning struct per connection). Exposes the upward interface of §6
//! (`dtp_create`/`dtp_destroy`/`dtp_write`/`dtp_receive`/
//! `dtcp_common_rcv_control`, observability reads) and the policy-set
//! selection surface of Design Notes 1 and 3.
#![deny(missing_docs)]
mod error;
mod policy;
mod transport;

pub use crate::error::ConnectionError;
pub use crate::policy::PolicySetSlot;
pub use crate::transport::{decode_pdu, receive_loop, ChannelRmt};

pub use dtcp::{DtcpConfig, FlowControlConfig, RateConfig, RtxControlConfig, WindowConfig};
pub use dtp::{ConnectionId, DtpConfig};

use dtcp::{DefaultDtcpPolicySet, Dtcp};
use dtp::{DefaultDtpPolicySet, Dtp, EfcpUpcall, FlowControl, InitialSequenceNumber, Pdu, PduType, Rmt, SharedState, Stats};
use log::debug;
use std::sync::Arc;

/// One allocated connection: a DTP engine, its optional DTCP sibling, and
/// the state they share.
pub struct Connection {
    id: ConnectionId,
    shared: Arc<SharedState>,
    dtp: Dtp<DefaultDtpPolicySet>,
    dtcp: Option<Arc<Dtcp<DefaultDtcpPolicySet>>>,
    dtp_policy: PolicySetSlot,
    dtcp_policy: PolicySetSlot,
}

impl Connection {
    /// `dtp_create` (§6): allocates a connection, building a DTCP sibling
    /// iff `dtcp_config` is `Some`, and wiring it into the DTP engine as a
    /// [`FlowControl`] implementor without `dtp` ever depending on `dtcp`
    /// (Design Note 2).
    pub fn create(id: ConnectionId, dtp_config: DtpConfig, dtcp_config: Option<DtcpConfig>, rmt: Arc<dyn Rmt>, efcp: Arc<dyn EfcpUpcall>) -> Self {
        let window_based = dtcp_config.map(|c| c.window_based()).unwrap_or(false);
        let rate_based = dtcp_config.map(|c| c.rate_based()).unwrap_or(false);
        let rexmsn_ctrl = dtcp_config.map(|c| c.rexmsn_ctrl()).unwrap_or(false);

        let initial_seq_num = DefaultDtpPolicySet.initial_seq_num();
        let shared = Arc::new(SharedState::new(&dtp_config, initial_seq_num, window_based, rate_based, rexmsn_ctrl));

        let dtcp = dtcp_config.map(|cfg| Arc::new(Dtcp::new(id, cfg, shared.clone(), rmt.clone(), efcp.clone())));
        let flow_control: Option<Arc<dyn FlowControl>> = dtcp.clone().map(|d| d as Arc<dyn FlowControl>);

        let dtp = Dtp::new(id, dtp_config, shared.clone(), rmt, efcp, flow_control);
        if rate_based {
            dtp.start_rate_window();
        }

        debug!("connection created on port {}", id.port_id);
        Self {
            id,
            shared,
            dtp,
            dtcp,
            dtp_policy: PolicySetSlot::new(),
            dtcp_policy: PolicySetSlot::new(),
        }
    }

    /// `dtp_destroy` (§6): safe even while peers are sending. Stops every
    /// timer before flushing the shared queues so no timer can revive a
    /// destroyed connection (§5).
    pub fn destroy(&self) {
        if let Some(dtcp) = &self.dtcp {
            dtcp.destroy();
        }
        self.dtp.destroy();
        debug!("connection destroyed on port {}", self.id.port_id);
    }

    /// `dtp_write` (§6).
    pub async fn write(&self, sdu: bytes::Bytes) -> Result<(), ConnectionError> {
        self.dtp.write(sdu).await.map_err(Into::into)
    }

    /// `dtp_receive` (§6): called by the RMT on incoming data PDUs.
    pub async fn dtp_receive(&self, pdu: Pdu) -> Result<(), ConnectionError> {
        self.dtp.receive(pdu).await.map_err(Into::into)
    }

    /// `dtcp_common_rcv_control` (§6): called by the RMT on incoming control
    /// PDUs. Fails with [`ConnectionError::NoDtcp`] if this connection has no
    /// DTCP instance.
    pub async fn dtcp_common_rcv_control(&self, pdu: Pdu) -> Result<(), ConnectionError> {
        let dtcp = self.dtcp.as_ref().ok_or(ConnectionError::NoDtcp)?;
        dtcp.common_rcv_control(pdu).await.map_err(ConnectionError::Io)
    }

    /// Dispatches an inbound PDU to [`Connection::dtp_receive`] or
    /// [`Connection::dtcp_common_rcv_control`] by its `PduType`, for callers
    /// that accept PDUs off a single transport without branching themselves.
    pub async fn receive(&self, pdu: Pdu) -> Result<(), ConnectionError> {
        if pdu.pci.pdu_type == PduType::Dt || pdu.pci.pdu_type == PduType::Mgmt {
            self.dtp_receive(pdu).await
        } else if self.dtcp.is_some() {
            self.dtcp_common_rcv_control(pdu).await
        } else {
            Err(ConnectionError::UnexpectedControlPdu)
        }
    }

    /// `select_policy_set(path, name)` (§6, Design Notes 1 & 3). `path` is
    /// `"dtp"` or `"dtcp"`; only `"default"` is a recognized `name` in this
    /// workspace.
    pub fn select_policy_set(&self, path: &str, name: &str) -> Result<(), ConnectionError> {
        let slot = match path {
            "dtp" => &self.dtp_policy,
            "dtcp" => &self.dtcp_policy,
            _ => {
                return Err(ConnectionError::UnknownPolicySet {
                    path: path.to_string(),
                    name: name.to_string(),
                })
            }
        };
        if slot.select(name) {
            Ok(())
        } else {
            Err(ConnectionError::UnknownPolicySet {
                path: path.to_string(),
                name: name.to_string(),
            })
        }
    }

    /// The currently selected policy-set name for `path` (feeds the
    /// `ps_name` observability read, §6).
    pub fn ps_name(&self, path: &str) -> Option<String> {
        match path {
            "dtp" => Some(self.dtp_policy.get()),
            "dtcp" => Some(self.dtcp_policy.get()),
            _ => None,
        }
    }

    /// Current RTT estimate in milliseconds, `0` if no DTCP is present or no
    /// sample has been taken yet.
    pub fn rtt(&self) -> i64 {
        self.dtcp.as_ref().map(|d| d.rtt()).unwrap_or(0)
    }

    /// `snd_rt_wind_edge` (observability, §6).
    pub fn snd_rt_win_edge(&self) -> u64 {
        self.shared.sv.with(|f| f.snd_rt_wind_edge())
    }

    /// `snd_lft_win` (observability, §6).
    pub fn snd_lft_win(&self) -> u64 {
        self.shared.sv.with(|f| f.snd_lft_win())
    }

    /// `rcv_rt_win_edge` (observability, §6).
    pub fn rcv_rt_win_edge(&self) -> u64 {
        self.shared.sv.with(|f| f.rcvr_rt_wind_edge())
    }

    /// `sndr_rate` (observability, §6).
    pub fn sndr_rate(&self) -> u32 {
        self.shared.sv.with(|f| f.sndr_rate())
    }

    /// `rcvr_rate` (observability, §6).
    pub fn rcvr_rate(&self) -> u32 {
        self.shared.sv.with(|f| f.rcvr_rate())
    }

    /// `closed_win_q_length` (observability, §6).
    pub fn closed_win_q_length(&self) -> usize {
        self.shared.cwq.size()
    }

    /// `rtx_q_length` (observability, §6).
    pub fn rtx_q_length(&self) -> usize {
        self.shared.rtxq.size()
    }

    /// `rtx_drop_pdus` (observability, §6).
    pub fn rtx_drop_pdus(&self) -> u64 {
        self.shared.rtxq.drop_pdus()
    }

    /// `{drop,err,tx,rx}_pdus` and `{tx,rx}_bytes` (observability, §6).
    pub fn stats(&self) -> Stats {
        self.shared.sv.stats()
    }

    /// This connection's identity.
    pub fn connection_id(&self) -> ConnectionId {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use channel::Channel;
    use dtp::Address;
    use std::sync::Mutex;

    struct NullRmt;

    #[async_trait]
    impl Rmt for NullRmt {
        async fn send(&self, _pdu: Pdu) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct RecordingUpcall {
        posted: Mutex<Vec<bytes::Bytes>>,
        write_enabled: Mutex<bool>,
    }

    impl RecordingUpcall {
        fn new() -> Self {
            Self {
                posted: Mutex::new(Vec::new()),
                write_enabled: Mutex::new(true),
            }
        }
    }

    #[async_trait]
    impl EfcpUpcall for RecordingUpcall {
        async fn post(&self, payload: bytes::Bytes) {
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

    #[test]
    fn create_without_dtcp_writes_directly_to_rmt() {
        async_std::task::block_on(async {
            let conn = Connection::create(connection_id(), DtpConfig::default(), None, Arc::new(NullRmt), Arc::new(RecordingUpcall::new()));
            conn.write(bytes::Bytes::from_static(b"hello")).await.unwrap();
            assert_eq!(conn.stats().tx_pdus, 1);
            conn.destroy();
        });
    }

    #[test]
    fn select_policy_set_accepts_only_default() {
        let conn = Connection::create(connection_id(), DtpConfig::default(), None, Arc::new(NullRmt), Arc::new(RecordingUpcall::new()));
        assert!(conn.select_policy_set("dtp", "default").is_ok());
        assert!(conn.select_policy_set("dtp", "exotic").is_err());
        assert!(conn.select_policy_set("rmt", "default").is_err());
        assert_eq!(conn.ps_name("dtp").as_deref(), Some("default"));
    }

    #[test]
    fn dtcp_common_rcv_control_without_dtcp_errs() {
        async_std::task::block_on(async {
            let conn = Connection::create(connection_id(), DtpConfig::default(), None, Arc::new(NullRmt), Arc::new(RecordingUpcall::new()));
            let pci = dtp::Pci {
                pdu_type: PduType::Ack,
                flags: 0,
                source: addr(1000),
                destination: addr(2000),
                source_cep_id: 1,
                destination_cep_id: 2,
                qos_id: 0,
                sequence_number: 1,
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
            };
            let err = conn.dtcp_common_rcv_control(Pdu::new(pci, bytes::Bytes::new())).await;
            assert!(matches!(err, Err(ConnectionError::NoDtcp)));
        });
    }

    #[test]
    fn two_connections_without_dtcp_exchange_data_end_to_end() {
        async_std::task::block_on(async {
            let (tx_a, rx_b) = test_channel::LossyChannelBuilder::new(1.0, 0.0).split();
            let upcall_b = Arc::new(RecordingUpcall::new());
            let conn_a = Connection::create(
                connection_id(),
                DtpConfig::default(),
                None,
                Arc::new(ChannelRmt::new(tx_a)),
                Arc::new(RecordingUpcall::new()),
            );
            let conn_b = Connection::create(connection_id(), DtpConfig::default(), None, Arc::new(NullRmt), upcall_b.clone());

            for sdu in &["first", "second", "third"] {
                conn_a.write(bytes::Bytes::from_static(sdu.as_bytes())).await.unwrap();
                let packet = rx_b.recv().await.unwrap();
                let pdu = decode_pdu(&packet).unwrap();
                conn_b.receive(pdu).await.unwrap();
            }

            let posted = upcall_b.posted.lock().unwrap();
            assert_eq!(
                posted.as_slice(),
                [bytes::Bytes::from_static(b"first"), bytes::Bytes::from_static(b"second"), bytes::Bytes::from_static(b"third")]
            );
            assert_eq!(conn_a.stats().tx_pdus, 3);
            assert_eq!(conn_b.stats().rx_pdus, 3);
        });
    }

    /// End-to-end check of P4 (ACK drains RTXQ) across two real `Connection`s
    /// wired through a reliable `test-channel` transport rather than driving
    /// `Dtcp::common_rcv_control` directly against an in-process RTXQ.
    #[test]
    fn two_connections_with_rtx_control_ack_drains_rtxq_end_to_end() {
        async_std::task::block_on(async {
            let (tx_a, rx_b) = test_channel::LossyChannelBuilder::new(1.0, 0.0).split();
            let (tx_b, rx_a) = test_channel::LossyChannelBuilder::new(1.0, 0.0).split();

            let dtcp_cfg = DtcpConfig {
                flow_control: None,
                rtx_control: Some(RtxControlConfig::default()),
            };

            let conn_a = Connection::create(
                connection_id(),
                DtpConfig::default(),
                Some(dtcp_cfg),
                Arc::new(ChannelRmt::new(tx_a)),
                Arc::new(RecordingUpcall::new()),
            );
            let upcall_b = Arc::new(RecordingUpcall::new());
            let conn_b = Connection::create(connection_id(), DtpConfig::default(), Some(dtcp_cfg), Arc::new(ChannelRmt::new(tx_b)), upcall_b.clone());

            conn_a.write(bytes::Bytes::from_static(b"payload")).await.unwrap();
            assert_eq!(conn_a.rtx_q_length(), 1);

            let data_packet = rx_b.recv().await.unwrap();
            let data_pdu = decode_pdu(&data_packet).unwrap();
            conn_b.receive(data_pdu).await.unwrap();
            assert_eq!(upcall_b.posted.lock().unwrap().as_slice(), [bytes::Bytes::from_static(b"payload")]);

            let ack_packet = rx_a.recv().await.unwrap();
            let ack_pdu = decode_pdu(&ack_packet).unwrap();
            conn_a.receive(ack_pdu).await.unwrap();

            assert_eq!(conn_a.rtx_q_length(), 0);
        });
    }
}
