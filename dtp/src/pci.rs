//! Protocol Control Information: the fixed header carried on every PDU.
//!
//! A bit-packed header widened from a 3-byte transfer/control discriminator
//! into the full field set the data model names: addressing, cep-ids, qos,
//! sequencing, and the control-only fields used by FC/ACK/NACK/RENDEZVOUS
//! PDUs.
use crate::constants::{Address, CepId, QosId, SequenceNumber};
use byteorder::{BigEndian, ByteOrder};
use failure::Fail;

/// Discriminates the kind of PDU a PCI describes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PduType {
    /// Carries a user SDU.
    Dt,
    /// Flow-control-only control PDU.
    Fc,
    /// Cumulative acknowledgement.
    Ack,
    /// Negative acknowledgement (selective retransmit request).
    Nack,
    /// Acknowledgement plus a flow-control update.
    AckAndFc,
    /// Negative acknowledgement plus a flow-control update.
    NackAndFc,
    /// Confirms receipt of a rendezvous (or another control PDU needing an ack).
    ControlAck,
    /// Announces the sender is stuck in a zero-window state.
    Rendezvous,
    /// Selective acknowledgement (reserved, not emitted by the default policy set).
    SelAck,
    /// Management PDU, opaque to this layer.
    Mgmt,
}

impl PduType {
    fn to_wire(self) -> u8 {
        match self {
            PduType::Dt => 0,
            PduType::Fc => 1,
            PduType::Ack => 2,
            PduType::Nack => 3,
            PduType::AckAndFc => 4,
            PduType::NackAndFc => 5,
            PduType::ControlAck => 6,
            PduType::Rendezvous => 7,
            PduType::SelAck => 8,
            PduType::Mgmt => 9,
        }
    }

    fn from_wire(b: u8) -> Result<Self, PciError> {
        Ok(match b {
            0 => PduType::Dt,
            1 => PduType::Fc,
            2 => PduType::Ack,
            3 => PduType::Nack,
            4 => PduType::AckAndFc,
            5 => PduType::NackAndFc,
            6 => PduType::ControlAck,
            7 => PduType::Rendezvous,
            8 => PduType::SelAck,
            9 => PduType::Mgmt,
            _ => return Err(PciError::UnknownType(b)),
        })
    }

    /// Whether this type carries the control-only fields.
    pub fn is_control(self) -> bool {
        self != PduType::Dt && self != PduType::Mgmt
    }
}

/// Flag bits carried in the PCI `flags` byte.
pub mod flags {
    /// Data run flag: first PDU of a run, all previous PDUs acked.
    pub const DATA_RUN: u8 = 0b0000_0001;
    /// Explicit congestion notification, consumed but not acted upon by the core.
    pub const EXPLICIT_CONGESTION: u8 = 0b0000_0010;
}

/// Errors raised while building or parsing a [`Pci`].
#[derive(Debug, Fail)]
pub enum PciError {
    /// Buffer too short to contain a well-formed PCI.
    #[fail(display = "pci buffer too short: need {} have {}", need, have)]
    Short {
        /// Bytes required.
        need: usize,
        /// Bytes present.
        have: usize,
    },
    /// Unrecognized wire value for `type`.
    #[fail(display = "unknown pdu type byte: {}", _0)]
    UnknownType(u8),
    /// An address's string form doesn't fit in [`ADDR_FIELD_LEN`] bytes.
    #[fail(display = "address {:?} does not fit in {} bytes", addr, limit)]
    AddrTooLong {
        /// The address that didn't fit.
        addr: String,
        /// The field width it was encoded against.
        limit: usize,
    },
    /// An address field's bytes are not a valid encoded address.
    #[fail(display = "malformed address field: {}", _0)]
    MalformedAddr(String),
}

/// Width in bytes of one address field on the wire: one length byte plus up
/// to 63 bytes of the address's multiaddr-style string form, generous
/// enough for the longest uncompressed IPv6 multiaddr
/// (`/ip6/xxxx:xxxx:xxxx:xxxx:xxxx:xxxx:xxxx:xxxx/udp/65535`).
const ADDR_FIELD_LEN: usize = 64;

/// The fixed header carried on every PDU (§3).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Pci {
    /// PDU type.
    pub pdu_type: PduType,
    /// Flag bitset (see [`flags`]).
    pub flags: u8,
    /// Source process address.
    pub source: Address,
    /// Destination process address.
    pub destination: Address,
    /// Source connection-endpoint id.
    pub source_cep_id: CepId,
    /// Destination connection-endpoint id.
    pub destination_cep_id: CepId,
    /// Quality-of-service class.
    pub qos_id: QosId,
    /// Per-connection sequence number.
    pub sequence_number: SequenceNumber,
    /// Length of the carried SDU (or 0 for pure control PDUs).
    pub length: u32,
    /// Hop count / time-to-live, managed by the relaying layer.
    pub ttl: u8,

    /// Control-only: sequence number being acked/nacked.
    pub ack_nack_seq_num: SequenceNumber,
    /// Control-only: sender's advertised right window edge.
    pub new_rt_wind_edge: SequenceNumber,
    /// Control-only: sender's advertised left window edge.
    pub new_lf_wind_edge: SequenceNumber,
    /// Control-only: receiver's right window edge as seen locally.
    pub my_rt_wind_edge: SequenceNumber,
    /// Control-only: receiver's left window edge as seen locally.
    pub my_lf_wind_edge: SequenceNumber,
    /// Control-only: last control sequence number received from the peer.
    pub last_ctrl_seq_num_rcvd: SequenceNumber,
    /// Control-only: sender's advertised rate (PDUs or bytes per `time_frame`).
    pub sndr_rate: u32,
    /// Control-only: sender's advertised rate window, in milliseconds.
    pub time_frame: u32,
}

impl Pci {
    /// Whether the `DATA_RUN` flag is set.
    pub fn drf(&self) -> bool {
        self.flags & flags::DATA_RUN != 0
    }

    /// Whether the `EXPLICIT_CONGESTION` flag is set.
    pub fn ecn(&self) -> bool {
        self.flags & flags::EXPLICIT_CONGESTION != 0
    }

    /// Fixed-size encoding. Control-only fields are always present on the
    /// wire (zeroed for `DT`/`MGMT` PDUs) to keep the layout simple; widths
    /// here are generous, not driven by `DataTransferConstants`, which only
    /// bound application-level field ranges.
    pub fn encode(&self, buf: &mut [u8]) -> Result<(), PciError> {
        const LEN: usize = 1 + 1 + ADDR_FIELD_LEN + ADDR_FIELD_LEN + 4 + 4 + 2 + 8 + 4 + 1 + 8 + 8 + 8 + 8 + 8 + 8 + 4 + 4;
        if buf.len() < LEN {
            return Err(PciError::Short {
                need: LEN,
                have: buf.len(),
            });
        }
        let mut off = 0;
        buf[off] = self.pdu_type.to_wire();
        off += 1;
        buf[off] = self.flags;
        off += 1;
        encode_addr(&self.source, &mut buf[off..off + ADDR_FIELD_LEN])?;
        off += ADDR_FIELD_LEN;
        encode_addr(&self.destination, &mut buf[off..off + ADDR_FIELD_LEN])?;
        off += ADDR_FIELD_LEN;
        BigEndian::write_u32(&mut buf[off..off + 4], self.source_cep_id);
        off += 4;
        BigEndian::write_u32(&mut buf[off..off + 4], self.destination_cep_id);
        off += 4;
        BigEndian::write_u16(&mut buf[off..off + 2], self.qos_id);
        off += 2;
        BigEndian::write_u64(&mut buf[off..off + 8], self.sequence_number);
        off += 8;
        BigEndian::write_u32(&mut buf[off..off + 4], self.length);
        off += 4;
        buf[off] = self.ttl;
        off += 1;
        BigEndian::write_u64(&mut buf[off..off + 8], self.ack_nack_seq_num);
        off += 8;
        BigEndian::write_u64(&mut buf[off..off + 8], self.new_rt_wind_edge);
        off += 8;
        BigEndian::write_u64(&mut buf[off..off + 8], self.new_lf_wind_edge);
        off += 8;
        BigEndian::write_u64(&mut buf[off..off + 8], self.my_rt_wind_edge);
        off += 8;
        BigEndian::write_u64(&mut buf[off..off + 8], self.my_lf_wind_edge);
        off += 8;
        BigEndian::write_u64(&mut buf[off..off + 8], self.last_ctrl_seq_num_rcvd);
        off += 8;
        BigEndian::write_u32(&mut buf[off..off + 4], self.sndr_rate);
        off += 4;
        BigEndian::write_u32(&mut buf[off..off + 4], self.time_frame);
        Ok(())
    }

    /// Inverse of [`Pci::encode`].
    pub fn decode(buf: &[u8]) -> Result<Self, PciError> {
        const LEN: usize = 1 + 1 + ADDR_FIELD_LEN + ADDR_FIELD_LEN + 4 + 4 + 2 + 8 + 4 + 1 + 8 + 8 + 8 + 8 + 8 + 8 + 4 + 4;
        if buf.len() < LEN {
            return Err(PciError::Short {
                need: LEN,
                have: buf.len(),
            });
        }
        let mut off = 0;
        let pdu_type = PduType::from_wire(buf[off])?;
        off += 1;
        let flags = buf[off];
        off += 1;
        let source = decode_addr(&buf[off..off + ADDR_FIELD_LEN])?;
        off += ADDR_FIELD_LEN;
        let destination = decode_addr(&buf[off..off + ADDR_FIELD_LEN])?;
        off += ADDR_FIELD_LEN;
        let source_cep_id = BigEndian::read_u32(&buf[off..off + 4]);
        off += 4;
        let destination_cep_id = BigEndian::read_u32(&buf[off..off + 4]);
        off += 4;
        let qos_id = BigEndian::read_u16(&buf[off..off + 2]);
        off += 2;
        let sequence_number = BigEndian::read_u64(&buf[off..off + 8]);
        off += 8;
        let length = BigEndian::read_u32(&buf[off..off + 4]);
        off += 4;
        let ttl = buf[off];
        off += 1;
        let ack_nack_seq_num = BigEndian::read_u64(&buf[off..off + 8]);
        off += 8;
        let new_rt_wind_edge = BigEndian::read_u64(&buf[off..off + 8]);
        off += 8;
        let new_lf_wind_edge = BigEndian::read_u64(&buf[off..off + 8]);
        off += 8;
        let my_rt_wind_edge = BigEndian::read_u64(&buf[off..off + 8]);
        off += 8;
        let my_lf_wind_edge = BigEndian::read_u64(&buf[off..off + 8]);
        off += 8;
        let last_ctrl_seq_num_rcvd = BigEndian::read_u64(&buf[off..off + 8]);
        off += 8;
        let sndr_rate = BigEndian::read_u32(&buf[off..off + 4]);
        off += 4;
        let time_frame = BigEndian::read_u32(&buf[off..off + 4]);
        Ok(Self {
            pdu_type,
            flags,
            source,
            destination,
            source_cep_id,
            destination_cep_id,
            qos_id,
            sequence_number,
            length,
            ttl,
            ack_nack_seq_num,
            new_rt_wind_edge,
            new_lf_wind_edge,
            my_rt_wind_edge,
            my_lf_wind_edge,
            last_ctrl_seq_num_rcvd,
            sndr_rate,
            time_frame,
        })
    }

    /// Size in bytes of the encoded form.
    pub const ENCODED_LEN: usize = 1 + 1 + ADDR_FIELD_LEN + ADDR_FIELD_LEN + 4 + 4 + 2 + 8 + 4 + 1 + 8 + 8 + 8 + 8 + 8 + 8 + 4 + 4;
}

fn encode_addr(addr: &Address, buf: &mut [u8]) -> Result<(), PciError> {
    let s = addr.to_string();
    let bytes = s.as_bytes();
    if bytes.len() > buf.len() - 1 {
        return Err(PciError::AddrTooLong {
            addr: s,
            limit: buf.len() - 1,
        });
    }
    buf[0] = bytes.len() as u8;
    buf[1..1 + bytes.len()].copy_from_slice(bytes);
    Ok(())
}

fn decode_addr(buf: &[u8]) -> Result<Address, PciError> {
    let n = buf[0] as usize;
    if n > buf.len() - 1 {
        return Err(PciError::MalformedAddr(format!("length byte {} exceeds field", n)));
    }
    let s = std::str::from_utf8(&buf[1..1 + n]).map_err(|e| PciError::MalformedAddr(e.to_string()))?;
    s.parse().map_err(|_| PciError::MalformedAddr(s.to_string()))
}
