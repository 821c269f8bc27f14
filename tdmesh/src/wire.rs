//! Wire formats carried by the MAC phases.
//!
//! ## Sync packet (7 bytes)
//!
//! ```text
//! 0x46 0x08 || hop (1) || pan_id (2, big-endian) || 0xFF 0xFF
//! ```
//!
//! The master sends hop 0. Each relay increments the hop byte in place, so a
//! node that receives hop `h` sits at hop `h + 1`.
//!
//! ## Stream management element (6 bytes)
//!
//! The first five bytes are a 40-bit little-endian word packed LSB first:
//!
//! ```text
//! bits  0..8   src
//! bits  8..16  dst
//! bits 16..20  src_port
//! bits 20..24  dst_port
//! bits 24..27  redundancy
//! bits 27..31  period (ordinal)
//! bits 31..40  payload_size
//! ```
//!
//! The sixth byte is carried alongside the record: bits 0..4 hold the element
//! type, bit 4 the direction.
//!
//! ## Uplink message
//!
//! ```text
//! hop (1) || assignee (1) || report_count (1) || sme_count (1)
//! || reports || smes (sme_count x 6)
//!
//! report = 0x00 || node || predecessor                 (tree)
//!        | 0x01 || node || mask_len || mask[mask_len]  (mesh)
//! ```
//!
//! The first report is always the sender's own.

use alloc::vec::Vec;

use crate::packet::{Packet, PacketError};
use crate::types::{
    Direction, Hop, NodeId, Period, Redundancy, StreamId, StreamParameters, MAX_PACKET_SIZE,
    MAX_PAYLOAD_SIZE, MAX_PORT, SYNC_HOP_OFFSET, SYNC_MARKER, SYNC_PACKET_SIZE, SYNC_TRAILER,
};

/// Decoding failure. Receivers treat every variant as a missed reception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error("invalid redundancy ordinal {0}")]
    InvalidRedundancy(u8),
    #[error("invalid stream management element type {0}")]
    InvalidSmeType(u8),
    #[error("invalid topology report kind {0}")]
    InvalidReportKind(u8),
    #[error("neighbor mask of {0} bytes exceeds the id space")]
    InvalidMaskLength(u8),
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

/// Types that serialize into a [`Packet`].
pub trait Encode {
    /// Exact number of bytes `encode` writes.
    fn encoded_size(&self) -> usize;

    fn encode(&self, pkt: &mut Packet) -> Result<(), PacketError>;

    /// Encode into a fresh packet.
    fn to_packet(&self) -> Result<Packet, PacketError> {
        let mut pkt = Packet::new();
        self.encode(&mut pkt)?;
        Ok(pkt)
    }
}

/// Types that parse from a [`Packet`].
pub trait Decode: Sized {
    fn decode(pkt: &mut Packet) -> Result<Self, DecodeError>;

    /// Decode a whole frame, rejecting trailing bytes.
    fn decode_from_slice(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut pkt = Packet::from_slice(bytes)?;
        let value = Self::decode(&mut pkt)?;
        if !pkt.is_empty() {
            return Err(DecodeError::TrailingBytes(pkt.size()));
        }
        Ok(value)
    }
}

// ---------------------------------------------------------------------------
// Sync packet
// ---------------------------------------------------------------------------

/// Constraint on the hop byte of a received sync packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HopCheck {
    /// Any hop is acceptable (hooking without a static hop).
    Any,
    /// The encoded hop must equal this value.
    Equals(Hop),
}

/// Build the sync packet a node transmits at `hop`.
pub const fn sync_packet(hop: Hop, pan_id: u16) -> [u8; SYNC_PACKET_SIZE] {
    let pan = pan_id.to_be_bytes();
    [
        SYNC_MARKER[0],
        SYNC_MARKER[1],
        hop,
        pan[0],
        pan[1],
        SYNC_TRAILER[0],
        SYNC_TRAILER[1],
    ]
}

/// Structural validity of a received sync packet.
pub fn is_sync_packet(bytes: &[u8], timestamp_valid: bool, pan_id: u16, hop: HopCheck) -> bool {
    if !timestamp_valid || bytes.len() != SYNC_PACKET_SIZE {
        return false;
    }
    let pan = pan_id.to_be_bytes();
    let hop_ok = match hop {
        HopCheck::Any => true,
        HopCheck::Equals(expected) => bytes[SYNC_HOP_OFFSET] == expected,
    };
    bytes[0..2] == SYNC_MARKER
        && bytes[3] == pan[0]
        && bytes[4] == pan[1]
        && bytes[5..7] == SYNC_TRAILER
        && hop_ok
}

// ---------------------------------------------------------------------------
// Stream management elements
// ---------------------------------------------------------------------------

/// Bytes per element on the wire, including the out-of-band type byte.
pub const SME_SIZE: usize = 6;

/// Reservation protocol event carried by an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SmeType {
    Connect = 0,
    Closed = 1,
    Listen = 2,
    ResendSchedule = 3,
}

impl SmeType {
    pub const fn from_bits(value: u8) -> Option<Self> {
        match value {
            0 => Some(SmeType::Connect),
            1 => Some(SmeType::Closed),
            2 => Some(SmeType::Listen),
            3 => Some(SmeType::ResendSchedule),
            _ => None,
        }
    }
}

/// One reservation protocol event for one stream or server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamManagementElement {
    pub id: StreamId,
    pub params: StreamParameters,
    pub kind: SmeType,
}

const DIRECTION_BIT: u8 = 0x10;
const SME_TYPE_MASK: u8 = 0x0F;

impl StreamManagementElement {
    pub const fn new(id: StreamId, params: StreamParameters, kind: SmeType) -> Self {
        Self { id, params, kind }
    }

    /// Pack into the 5-byte record plus the out-of-band byte.
    ///
    /// Ports are truncated to 4 bits and payload size to 9 bits.
    pub fn pack(&self) -> [u8; SME_SIZE] {
        let word: u64 = self.id.src as u64
            | (self.id.dst as u64) << 8
            | ((self.id.src_port & MAX_PORT) as u64) << 16
            | ((self.id.dst_port & MAX_PORT) as u64) << 20
            | (self.params.redundancy.ordinal() as u64 & 0x7) << 24
            | (self.params.period.ordinal() as u64 & 0xF) << 27
            | ((self.params.payload_size & MAX_PAYLOAD_SIZE) as u64) << 31;
        let le = word.to_le_bytes();
        let mut out = [0u8; SME_SIZE];
        out[..5].copy_from_slice(&le[..5]);
        out[5] = (self.kind as u8 & SME_TYPE_MASK)
            | match self.params.direction {
                Direction::Up => 0,
                Direction::Down => DIRECTION_BIT,
            };
        out
    }

    pub fn unpack(bytes: &[u8; SME_SIZE]) -> Result<Self, DecodeError> {
        let mut le = [0u8; 8];
        le[..5].copy_from_slice(&bytes[..5]);
        let word = u64::from_le_bytes(le);

        let field = |shift: u32, width: u32| ((word >> shift) & ((1u64 << width) - 1)) as u16;

        let redundancy_bits = field(24, 3) as u8;
        let redundancy = Redundancy::from_ordinal(redundancy_bits)
            .ok_or(DecodeError::InvalidRedundancy(redundancy_bits))?;
        // 4 bits always name a period.
        let period = Period::from_ordinal(field(27, 4) as u8).unwrap_or_default();
        let kind_bits = bytes[5] & SME_TYPE_MASK;
        let kind = SmeType::from_bits(kind_bits).ok_or(DecodeError::InvalidSmeType(kind_bits))?;
        let direction = if bytes[5] & DIRECTION_BIT != 0 {
            Direction::Down
        } else {
            Direction::Up
        };

        Ok(Self {
            id: StreamId::new(
                field(0, 8) as u8,
                field(8, 8) as u8,
                field(16, 4) as u8,
                field(20, 4) as u8,
            ),
            params: StreamParameters::new(redundancy, period, field(31, 9), direction),
            kind,
        })
    }
}

impl Encode for StreamManagementElement {
    fn encoded_size(&self) -> usize {
        SME_SIZE
    }

    fn encode(&self, pkt: &mut Packet) -> Result<(), PacketError> {
        pkt.put(&self.pack())
    }
}

impl Decode for StreamManagementElement {
    fn decode(pkt: &mut Packet) -> Result<Self, DecodeError> {
        let mut raw = [0u8; SME_SIZE];
        pkt.get(&mut raw)?;
        Self::unpack(&raw)
    }
}

// ---------------------------------------------------------------------------
// Topology reports
// ---------------------------------------------------------------------------

/// Set of node ids, one bit per id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct NeighborMask([u8; 32]);

impl NeighborMask {
    pub const fn new() -> Self {
        Self([0; 32])
    }

    pub fn insert(&mut self, node: NodeId) {
        self.0[node as usize / 8] |= 1 << (node % 8);
    }

    pub fn remove(&mut self, node: NodeId) {
        self.0[node as usize / 8] &= !(1 << (node % 8));
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.0[node as usize / 8] & (1 << (node % 8)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn len(&self) -> usize {
        self.0.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..=u8::MAX).filter(|n| self.contains(*n))
    }

    /// Bytes needed on the wire: up to and including the last non-zero byte.
    fn wire_len(&self) -> usize {
        self.0.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1)
    }
}

impl FromIterator<NodeId> for NeighborMask {
    fn from_iter<I: IntoIterator<Item = NodeId>>(iter: I) -> Self {
        let mut mask = NeighborMask::new();
        for node in iter {
            mask.insert(node);
        }
        mask
    }
}

const REPORT_TREE: u8 = 0x00;
const REPORT_MESH: u8 = 0x01;

/// What a node tells the master about its position in the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopologyReport {
    /// Tree mode: the node's chosen predecessor.
    Tree { node: NodeId, predecessor: NodeId },
    /// Mesh mode: every neighbor the node currently hears.
    Mesh {
        node: NodeId,
        neighbors: NeighborMask,
    },
}

impl TopologyReport {
    pub const fn node(&self) -> NodeId {
        match self {
            TopologyReport::Tree { node, .. } | TopologyReport::Mesh { node, .. } => *node,
        }
    }
}

impl Encode for TopologyReport {
    fn encoded_size(&self) -> usize {
        match self {
            TopologyReport::Tree { .. } => 3,
            TopologyReport::Mesh { neighbors, .. } => 3 + neighbors.wire_len(),
        }
    }

    fn encode(&self, pkt: &mut Packet) -> Result<(), PacketError> {
        match self {
            TopologyReport::Tree { node, predecessor } => pkt.put(&[REPORT_TREE, *node, *predecessor]),
            TopologyReport::Mesh { node, neighbors } => {
                let len = neighbors.wire_len();
                if 3 + len > pkt.available() {
                    return Err(PacketError::Overflow {
                        requested: 3 + len,
                        available: pkt.available(),
                    });
                }
                pkt.put(&[REPORT_MESH, *node, len as u8])?;
                pkt.put(&neighbors.0[..len])
            }
        }
    }
}

impl Decode for TopologyReport {
    fn decode(pkt: &mut Packet) -> Result<Self, DecodeError> {
        match pkt.get_u8()? {
            REPORT_TREE => {
                let node = pkt.get_u8()?;
                let predecessor = pkt.get_u8()?;
                Ok(TopologyReport::Tree { node, predecessor })
            }
            REPORT_MESH => {
                let node = pkt.get_u8()?;
                let len = pkt.get_u8()?;
                if len as usize > 32 {
                    return Err(DecodeError::InvalidMaskLength(len));
                }
                let mut neighbors = NeighborMask::new();
                pkt.get(&mut neighbors.0[..len as usize])?;
                Ok(TopologyReport::Mesh { node, neighbors })
            }
            other => Err(DecodeError::InvalidReportKind(other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Uplink message
// ---------------------------------------------------------------------------

pub const UPLINK_HEADER_SIZE: usize = 4;

/// A node's transmission in its uplink slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UplinkMessage {
    /// Sender's hop.
    pub hop: Hop,
    /// Node asked to carry the payload one hop closer to the master.
    pub assignee: NodeId,
    /// Sender's own report first, then forwarded ones.
    pub reports: Vec<TopologyReport>,
    pub smes: Vec<StreamManagementElement>,
}

impl UplinkMessage {
    /// The transmitting node, taken from its own report.
    pub fn sender(&self) -> Option<NodeId> {
        self.reports.first().map(TopologyReport::node)
    }

    /// Bytes used by the header and reports.
    pub fn size_without_smes(&self) -> usize {
        UPLINK_HEADER_SIZE
            + self
                .reports
                .iter()
                .map(Encode::encoded_size)
                .sum::<usize>()
    }

    /// How many elements fit after the header and reports.
    pub fn sme_budget(&self) -> usize {
        MAX_PACKET_SIZE.saturating_sub(self.size_without_smes()) / SME_SIZE
    }
}

impl Encode for UplinkMessage {
    fn encoded_size(&self) -> usize {
        self.size_without_smes() + self.smes.len() * SME_SIZE
    }

    fn encode(&self, pkt: &mut Packet) -> Result<(), PacketError> {
        if self.encoded_size() > pkt.available() {
            return Err(PacketError::Overflow {
                requested: self.encoded_size(),
                available: pkt.available(),
            });
        }
        pkt.put(&[
            self.hop,
            self.assignee,
            self.reports.len() as u8,
            self.smes.len() as u8,
        ])?;
        for report in &self.reports {
            report.encode(pkt)?;
        }
        for sme in &self.smes {
            sme.encode(pkt)?;
        }
        Ok(())
    }
}

impl Decode for UplinkMessage {
    fn decode(pkt: &mut Packet) -> Result<Self, DecodeError> {
        let hop = pkt.get_u8()?;
        let assignee = pkt.get_u8()?;
        let report_count = pkt.get_u8()? as usize;
        let sme_count = pkt.get_u8()? as usize;

        let mut reports = Vec::with_capacity(report_count);
        for _ in 0..report_count {
            reports.push(TopologyReport::decode(pkt)?);
        }
        if sme_count * SME_SIZE > pkt.size() {
            return Err(PacketError::Underflow {
                requested: sme_count * SME_SIZE,
                remaining: pkt.size(),
            }
            .into());
        }
        let mut smes = Vec::with_capacity(sme_count);
        for _ in 0..sme_count {
            smes.push(StreamManagementElement::decode(pkt)?);
        }
        Ok(Self {
            hop,
            assignee,
            reports,
            smes,
        })
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;

    const PAN: u16 = 0x1A2B;

    #[test]
    fn test_sync_packet_layout() {
        assert_eq!(
            sync_packet(3, PAN),
            [0x46, 0x08, 3, 0x1A, 0x2B, 0xFF, 0xFF]
        );
    }

    #[test]
    fn test_canonical_sync_packet_accepted() {
        let pkt = sync_packet(1, PAN);
        assert!(is_sync_packet(&pkt, true, PAN, HopCheck::Any));
        assert!(is_sync_packet(&pkt, true, PAN, HopCheck::Equals(1)));
    }

    #[test]
    fn test_any_single_field_flip_rejects() {
        let good = sync_packet(1, PAN);
        for index in [0usize, 1, 3, 4, 5, 6] {
            let mut bad = good;
            bad[index] ^= 0x01;
            assert!(
                !is_sync_packet(&bad, true, PAN, HopCheck::Any),
                "flipping byte {index} must reject"
            );
        }
        // Hop mismatched with expectation.
        assert!(!is_sync_packet(&good, true, PAN, HopCheck::Equals(2)));
        // Timestamp capture failed.
        assert!(!is_sync_packet(&good, false, PAN, HopCheck::Any));
        // Wrong PAN configured locally.
        assert!(!is_sync_packet(&good, true, PAN + 1, HopCheck::Any));
        // Wrong length.
        assert!(!is_sync_packet(&good[..6], true, PAN, HopCheck::Any));
        let mut long = [0u8; 8];
        long[..7].copy_from_slice(&good);
        assert!(!is_sync_packet(&long, true, PAN, HopCheck::Any));
    }

    #[test]
    fn test_sme_bit_layout() {
        let sme = StreamManagementElement::new(
            StreamId::new(0x12, 0x34, 0x5, 0xA),
            StreamParameters::new(Redundancy::Triple, Period::P100, 0x1FF, Direction::Down),
            SmeType::Listen,
        );
        let raw = sme.pack();
        // src and dst occupy the first two bytes verbatim.
        assert_eq!(raw[0], 0x12);
        assert_eq!(raw[1], 0x34);
        // src_port in the low nibble, dst_port in the high nibble.
        assert_eq!(raw[2], 0xA5);
        // redundancy (3) in bits 24..27, period ordinal (9) in bits 27..31,
        // lowest payload bit in bit 31.
        assert_eq!(raw[3], 0b1_1001_011);
        // remaining 8 payload bits.
        assert_eq!(raw[4], 0xFF);
        assert_eq!(raw[5], SmeType::Listen as u8 | 0x10);

        assert_eq!(StreamManagementElement::unpack(&raw).unwrap(), sme);
    }

    #[test]
    fn test_sme_rejects_bad_redundancy_and_type() {
        let mut raw = StreamManagementElement::new(
            StreamId::server(1, 1),
            StreamParameters::default(),
            SmeType::Connect,
        )
        .pack();
        raw[3] |= 0b111;
        assert_eq!(
            StreamManagementElement::unpack(&raw),
            Err(DecodeError::InvalidRedundancy(7))
        );
        raw[3] &= !0b111;
        raw[5] = 0x0E;
        assert_eq!(
            StreamManagementElement::unpack(&raw),
            Err(DecodeError::InvalidSmeType(0x0E))
        );
    }

    #[test]
    fn test_uplink_message_roundtrip_and_budget() {
        let neighbors: NeighborMask = [0u8, 2, 9].into_iter().collect();
        let sme = StreamManagementElement::new(
            StreamId::new(5, 2, 1, 3),
            StreamParameters::new(Redundancy::None, Period::P10, 20, Direction::Up),
            SmeType::Connect,
        );
        let msg = UplinkMessage {
            hop: 2,
            assignee: 1,
            reports: vec![
                TopologyReport::Mesh { node: 5, neighbors },
                TopologyReport::Tree {
                    node: 7,
                    predecessor: 5,
                },
            ],
            smes: vec![sme],
        };
        assert_eq!(msg.sender(), Some(5));
        // header 4 + mesh (3 + 2 mask bytes) + tree 3
        assert_eq!(msg.size_without_smes(), 12);
        assert_eq!(msg.sme_budget(), (MAX_PACKET_SIZE - 12) / SME_SIZE);

        let pkt = msg.to_packet().unwrap();
        assert_eq!(pkt.size(), 12 + SME_SIZE);
        let decoded = UplinkMessage::decode_from_slice(pkt.data()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_truncated_uplink_is_malformed() {
        let msg = UplinkMessage {
            hop: 1,
            assignee: 0,
            reports: vec![TopologyReport::Tree {
                node: 3,
                predecessor: 0,
            }],
            smes: vec![],
        };
        let pkt = msg.to_packet().unwrap();
        let data = pkt.data();
        let err = UplinkMessage::decode_from_slice(&data[..data.len() - 1]).unwrap_err();
        assert!(matches!(err, DecodeError::Packet(PacketError::Underflow { .. })));

        let mut lying = [0u8; 4];
        lying.copy_from_slice(&data[..4]);
        lying[3] = 3; // claims three elements that are not there
        assert!(UplinkMessage::decode_from_slice(&lying).is_err());
    }

    #[test]
    fn test_neighbor_mask_ops() {
        let mut mask = NeighborMask::new();
        assert!(mask.is_empty());
        mask.insert(0);
        mask.insert(200);
        assert!(mask.contains(200));
        assert_eq!(mask.len(), 2);
        mask.remove(0);
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![200]);
        assert_eq!(mask.wire_len(), 26);
    }
}
