//! Data Transfer Constants: DIF-wide values fixed once a DIF is formed and
//! immutable for the lifetime of every connection that uses them.
//!
//! Widened from a single-sequence-number typedef into the full set of
//! per-DIF constants named by the PCI field widths and timer bounds.
use addr::Addr;

/// Process address. A connection's `source_address`/`destination_address`.
pub type Address = Addr;
/// Per-process connection-endpoint identifier.
pub type CepId = u32;
/// Local handle exposed to the upper layer.
pub type PortId = u32;
/// Quality of service class identifier.
pub type QosId = u16;
/// Per-connection sequence number. Never wraps (replay protection, see A1).
pub type SequenceNumber = u64;
/// Monotonic clock type used for timestamps.
pub type Instant = std::time::Instant;

/// DIF-wide Data Transfer Constants, assigned once and shared by every
/// connection created within the DIF.
#[derive(Clone, Copy, Debug)]
pub struct DataTransferConstants {
    /// Length in bytes of an address field on the wire.
    pub address_length: u8,
    /// Length in bytes of a cep-id field on the wire.
    pub cep_id_length: u8,
    /// Length in bytes of a port-id field (locally significant only).
    pub port_id_length: u8,
    /// Length in bytes of a qos-id field on the wire.
    pub qos_id_length: u8,
    /// Length in bytes of a sequence number field on the wire.
    pub sequence_number_length: u8,
    /// Length in bytes of the PDU length field on the wire.
    pub length_length: u8,
    /// Maximum PDU size permitted in this DIF.
    pub max_pdu_size: u32,
    /// Maximum PDU lifetime (MPL) in milliseconds.
    pub max_pdu_lifetime: u32,
    /// Whether this DIF requires CRC/integrity checking at this layer.
    pub dif_integrity: bool,
}

impl Default for DataTransferConstants {
    fn default() -> Self {
        Self {
            address_length: 4,
            cep_id_length: 4,
            port_id_length: 4,
            qos_id_length: 2,
            sequence_number_length: 8,
            length_length: 4,
            max_pdu_size: 65535,
            max_pdu_lifetime: 1000,
            dif_integrity: false,
        }
    }
}
