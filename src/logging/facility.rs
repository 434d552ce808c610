// Logging facilities (component identifiers)

use serde::{Deserialize, Serialize};

/// Identifies which pipeline component generated a log record.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Facility {
    /// Core manager bootstrap and lifecycle
    Manager = 0,
    /// Runtime bring-up: lcore discovery, pinning
    Runtime = 1,
    /// Ethernet device bring-up and burst I/O
    Device = 2,
    /// Huge-page shared buffer arena
    SharedBuffer = 3,

    // Data-plane cores
    /// NIC polling, control-plane replies, UDP fan-out
    PacketRx = 4,
    /// Super-frame assembly
    PacketProcessor = 5,
    /// Reordering and missing-payload clearing
    FrameBuilder = 6,
    /// Block compression
    FrameCompressor = 7,
    /// Host callback bridging
    FrameWrapper = 8,

    /// Test harness and fixtures
    Test = 9,

    /// Fallback for uncategorized records
    Unknown = 255,
}

impl Facility {
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Facility::Manager => "Manager",
            Facility::Runtime => "Runtime",
            Facility::Device => "Device",
            Facility::SharedBuffer => "SharedBuffer",
            Facility::PacketRx => "PacketRx",
            Facility::PacketProcessor => "PacketProcessor",
            Facility::FrameBuilder => "FrameBuilder",
            Facility::FrameCompressor => "FrameCompressor",
            Facility::FrameWrapper => "FrameWrapper",
            Facility::Test => "Test",
            Facility::Unknown => "Unknown",
        }
    }

    /// Create from u8 value (returns Unknown if invalid)
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Facility::Manager,
            1 => Facility::Runtime,
            2 => Facility::Device,
            3 => Facility::SharedBuffer,
            4 => Facility::PacketRx,
            5 => Facility::PacketProcessor,
            6 => Facility::FrameBuilder,
            7 => Facility::FrameCompressor,
            8 => Facility::FrameWrapper,
            9 => Facility::Test,
            _ => Facility::Unknown,
        }
    }
}

impl std::fmt::Display for Facility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
