//! A PDU is a [`Pci`] plus the SDU bytes it carries (empty for pure control
//! PDUs).
use crate::pci::{Pci, PciError, PduType};
use bytes::Bytes;

/// A fully-formed protocol data unit: header plus payload.
#[derive(Clone, Debug, PartialEq)]
pub struct Pdu {
    /// The header.
    pub pci: Pci,
    /// The carried SDU, empty for control PDUs.
    pub payload: Bytes,
}

impl Pdu {
    /// Builds a PDU, filling `pci.length` from the payload length.
    pub fn new(mut pci: Pci, payload: Bytes) -> Self {
        pci.length = payload.len() as u32;
        Self { pci, payload }
    }

    /// Sequence number carried in the PCI, for convenience.
    pub fn sequence_number(&self) -> crate::constants::SequenceNumber {
        self.pci.sequence_number
    }

    /// Whether this PDU carries user data (as opposed to being a pure
    /// control PDU).
    pub fn is_data(&self) -> bool {
        self.pci.pdu_type == PduType::Dt
    }

    /// Creates an owned duplicate that shares no mutable state with `self`
    /// (used when a PDU must live in both the send path and a retention
    /// queue, per the data model's ownership rule on `pdu_dup`).
    pub fn duplicate(&self) -> Self {
        self.clone()
    }

    /// Encodes PCI + payload onto the wire.
    pub fn encode(&self) -> Result<Vec<u8>, PciError> {
        let mut buf = vec![0u8; Pci::ENCODED_LEN + self.payload.len()];
        self.pci.encode(&mut buf[..Pci::ENCODED_LEN])?;
        buf[Pci::ENCODED_LEN..].copy_from_slice(&self.payload);
        Ok(buf)
    }

    /// Decodes a PDU previously produced by [`Pdu::encode`].
    pub fn decode(buf: &[u8]) -> Result<Self, PciError> {
        let pci = Pci::decode(&buf[..Pci::ENCODED_LEN.min(buf.len())])?;
        let payload = Bytes::from(buf[Pci::ENCODED_LEN..].to_vec());
        Ok(Self { pci, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pci::flags;

    fn sample_pci(seq: u64) -> Pci {
        Pci {
            pdu_type: PduType::Dt,
            flags: flags::DATA_RUN,
            source: "/ip4/127.0.0.1/udp/1000".parse().unwrap(),
            destination: "/ip4/127.0.0.1/udp/2000".parse().unwrap(),
            source_cep_id: 1,
            destination_cep_id: 2,
            qos_id: 0,
            sequence_number: seq,
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

    #[test]
    fn round_trip_with_payload() {
        let pdu = Pdu::new(sample_pci(5), Bytes::from_static(b"hello"));
        let encoded = pdu.encode().unwrap();
        let decoded = Pdu::decode(&encoded).unwrap();
        assert_eq!(pdu, decoded);
        assert_eq!(decoded.pci.length, 5);
    }

    #[test]
    fn duplicate_is_independent_copy() {
        let pdu = Pdu::new(sample_pci(1), Bytes::from_static(b"x"));
        let dup = pdu.duplicate();
        assert_eq!(pdu, dup);
    }
}
