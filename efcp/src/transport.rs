//! Bridges the generic [`channel::Channel`] transport abstraction to the
//! [`dtp::Rmt`] trait a [`crate::Connection`] sends through.
//!
//! Each PDU is encoded as a fixed PCI header (`Pci::ENCODED_LEN` bytes)
//! followed by the raw SDU payload, the same flat framing `channel`'s own
//! packet wrappers use for their headers (`channel/src/lib.rs` test module).
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use channel::Channel;
use dtp::{Pci, Pdu, Rmt};
use std::io::{Error, ErrorKind, Result as IoResult};
use std::sync::Arc;

/// Adapts any `Channel<Packet = BytesMut>` into an [`Rmt`] a [`crate::Connection`]
/// can send PDUs through.
pub struct ChannelRmt<C> {
    channel: C,
}

impl<C> ChannelRmt<C> {
    /// Wraps `channel`.
    pub fn new(channel: C) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl<C> Rmt for ChannelRmt<C>
where
    C: Channel<Packet = BytesMut> + Send + Sync,
{
    async fn send(&self, pdu: Pdu) -> IoResult<()> {
        let mut buf = BytesMut::with_capacity(Pci::ENCODED_LEN + pdu.payload.len());
        buf.resize(Pci::ENCODED_LEN, 0);
        pdu.pci
            .encode(&mut buf[..Pci::ENCODED_LEN])
            .map_err(|e| Error::new(ErrorKind::InvalidData, e.to_string()))?;
        buf.extend_from_slice(&pdu.payload);
        self.channel.send(buf).await
    }
}

/// Decodes one `Channel` packet back into a [`Pdu`], the inverse of
/// [`ChannelRmt::send`]'s framing.
pub fn decode_pdu(packet: &[u8]) -> IoResult<Pdu> {
    if packet.len() < Pci::ENCODED_LEN {
        return Err(Error::new(ErrorKind::UnexpectedEof, "packet shorter than pci"));
    }
    let pci = Pci::decode(&packet[..Pci::ENCODED_LEN]).map_err(|e| Error::new(ErrorKind::InvalidData, e.to_string()))?;
    let payload = Bytes::from(packet[Pci::ENCODED_LEN..].to_vec());
    Ok(Pdu::new(pci, payload))
}

/// Drives `channel.recv()` in a loop, decoding each packet and handing it to
/// `on_pdu`. Returns on the first transport error.
pub async fn receive_loop<C, F, Fut>(channel: Arc<C>, mut on_pdu: F) -> IoResult<()>
where
    C: Channel<Packet = BytesMut> + Send + Sync,
    F: FnMut(Pdu) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    loop {
        let packet = channel.recv().await?;
        let pdu = decode_pdu(&packet)?;
        on_pdu(pdu).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use channel::Loopback;
    use dtp::{flags, PduType};

    fn sample_pdu() -> Pdu {
        Pdu::new(
            Pci {
                pdu_type: PduType::Dt,
                flags: flags::DATA_RUN,
                source: "/ip4/127.0.0.1/udp/1".parse().unwrap(),
                destination: "/ip4/127.0.0.1/udp/2".parse().unwrap(),
                source_cep_id: 1,
                destination_cep_id: 2,
                qos_id: 0,
                sequence_number: 7,
                length: 5,
                ttl: 64,
                ack_nack_seq_num: 0,
                new_rt_wind_edge: 0,
                new_lf_wind_edge: 0,
                my_rt_wind_edge: 0,
                my_lf_wind_edge: 0,
                last_ctrl_seq_num_rcvd: 0,
                sndr_rate: 0,
                time_frame: 0,
            },
            Bytes::from_static(b"hello"),
        )
    }

    #[test]
    fn send_then_decode_round_trips() {
        async_std::task::block_on(async {
            let rmt = ChannelRmt::new(Loopback::default());
            let pdu = sample_pdu();
            rmt.send(pdu.duplicate()).await.unwrap();
            let packet = rmt.channel.recv().await.unwrap();
            let decoded = decode_pdu(&packet).unwrap();
            assert_eq!(decoded.pci.sequence_number, pdu.pci.sequence_number);
            assert_eq!(decoded.payload, pdu.payload);
        });
    }
}
