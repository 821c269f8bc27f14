//! Core types and constants for the MAC layer.

use crate::config::ConfigError;
use crate::packet::PacketError;
use crate::wire::DecodeError;

/// Largest frame the radio carries, in bytes.
pub const MAX_PACKET_SIZE: usize = 125;

// Sync packet layout: marker, hop, PAN id (big-endian), trailer.
pub const SYNC_PACKET_SIZE: usize = 7;
pub const SYNC_MARKER: [u8; 2] = [0x46, 0x08];
pub const SYNC_TRAILER: [u8; 2] = [0xFF, 0xFF];
pub const SYNC_HOP_OFFSET: usize = 2;

/// Ports are carried in 4-bit wire fields.
pub const MAX_PORT: u8 = 0x0F;

/// Payload sizes are carried in a 9-bit wire field.
pub const MAX_PAYLOAD_SIZE: u16 = 0x1FF;

/// Network-local node identifier.
pub type NodeId = u8;

/// Relay distance from the master.
pub type Hop = u8;

/// Received signal strength in dBm.
pub type Rssi = i16;

/// The master is always node 0.
pub const MASTER_ID: NodeId = 0;

/// Role of a node in the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Follower,
}

impl Role {
    pub const fn of(node: NodeId) -> Self {
        if node == MASTER_ID {
            Role::Master
        } else {
            Role::Follower
        }
    }
}

/// What each node reports about its surroundings during the uplink phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TopologyMode {
    /// Each node reports only its chosen predecessor.
    #[default]
    Tree,
    /// Each node reports its full neighbor set.
    Mesh,
}

/// Identifies a stream, or a server when `src == dst`.
///
/// A server endpoint is written `(node, node, 0, port)`. Streams point at
/// their server through the destination node and port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId {
    pub src: NodeId,
    pub dst: NodeId,
    pub src_port: u8,
    pub dst_port: u8,
}

impl StreamId {
    pub const fn new(src: NodeId, dst: NodeId, src_port: u8, dst_port: u8) -> Self {
        Self {
            src,
            dst,
            src_port,
            dst_port,
        }
    }

    /// The listening endpoint on `node` at `port`.
    pub const fn server(node: NodeId, port: u8) -> Self {
        Self::new(node, node, 0, port)
    }

    pub const fn is_server(&self) -> bool {
        self.src == self.dst
    }

    pub const fn is_stream(&self) -> bool {
        !self.is_server()
    }

    /// The server a stream connects to.
    pub const fn server_id(&self) -> StreamId {
        StreamId::server(self.dst, self.dst_port)
    }
}

/// Redundancy level requested for a stream.
///
/// Ordered by ordinal value; negotiation keeps the lower one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Redundancy {
    #[default]
    None = 0,
    Double = 1,
    DoubleSpatial = 2,
    Triple = 3,
    TripleSpatial = 4,
}

impl Redundancy {
    pub const fn ordinal(self) -> u8 {
        self as u8
    }

    pub const fn from_ordinal(value: u8) -> Option<Self> {
        match value {
            0 => Some(Redundancy::None),
            1 => Some(Redundancy::Double),
            2 => Some(Redundancy::DoubleSpatial),
            3 => Some(Redundancy::Triple),
            4 => Some(Redundancy::TripleSpatial),
            _ => None,
        }
    }
}

/// Stream period, in multiples of the data tile duration.
///
/// The ordinal is what goes on the wire (4 bits); it grows with the period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Period {
    P0dot1 = 0,
    P0dot2 = 1,
    P0dot5 = 2,
    #[default]
    P1 = 3,
    P2 = 4,
    P5 = 5,
    P10 = 6,
    P20 = 7,
    P50 = 8,
    P100 = 9,
    P200 = 10,
    P500 = 11,
    P1000 = 12,
    P2000 = 13,
    P5000 = 14,
    P10000 = 15,
}

impl Period {
    const ALL: [Period; 16] = [
        Period::P0dot1,
        Period::P0dot2,
        Period::P0dot5,
        Period::P1,
        Period::P2,
        Period::P5,
        Period::P10,
        Period::P20,
        Period::P50,
        Period::P100,
        Period::P200,
        Period::P500,
        Period::P1000,
        Period::P2000,
        Period::P5000,
        Period::P10000,
    ];

    pub const fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn from_ordinal(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    /// Period length in tenths of a tile.
    pub const fn tenths_of_tile(self) -> u32 {
        const TENTHS: [u32; 16] = [
            1, 2, 5, 10, 20, 50, 100, 200, 500, 1_000, 2_000, 5_000, 10_000, 20_000, 50_000,
            100_000,
        ];
        TENTHS[self as usize]
    }
}

/// Data direction of a stream relative to its client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Direction {
    #[default]
    Up,
    Down,
}

/// Requested or negotiated stream parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamParameters {
    pub redundancy: Redundancy,
    pub period: Period,
    pub payload_size: u16,
    pub direction: Direction,
}

impl StreamParameters {
    pub const fn new(
        redundancy: Redundancy,
        period: Period,
        payload_size: u16,
        direction: Direction,
    ) -> Self {
        Self {
            redundancy,
            period,
            payload_size,
            direction,
        }
    }
}

/// Top-level error for fallible construction and codec use.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}
