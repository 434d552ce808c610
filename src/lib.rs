// SPDX-License-Identifier: Apache-2.0 OR MIT
//! framepipe: high-throughput detector readout core.
//!
//! Detector electronics emit UDP packets at multi-gigabit rates; each
//! packet carries a fragment of a frame, and frames group into
//! super-frames delivered downstream as one unit. This crate assembles
//! super-frames from packets with bounded memory and no locking on the
//! data path: a directed graph of worker cores, one per pinned CPU,
//! connected only by named lock-free rings over a huge-page shared buffer.
//!
//! The canonical topology:
//!
//! ```text
//! NIC -> PacketRx -> PacketProcessor (N) -> FrameBuilder (M)
//!     -> FrameCompressor (K, optional) -> FrameWrapper -> host callback
//! ```
//!
//! Detector specifics (wire header layout, super-frame geometry,
//! reordering) live behind the [`decoder::ProtocolDecoder`] capability;
//! the NIC is a black box behind [`nic::NetDevice`].

pub mod config;
pub mod decoder;
pub mod frame;
pub mod logging;
pub mod manager;
pub mod net;
pub mod nic;
pub mod packet;
pub mod ring;
pub mod runtime;
pub mod shared_buffer;
pub mod status;
pub mod worker;

pub use config::{ConfigUpdate, PipelineConfig, WorkerCoreConfig};
pub use decoder::{BitDepth, GridDecoder, GridGeometry, ProtocolDecoder};
pub use frame::{CompressionType, FrameCallback, FrameMetaData, SharedBufferFrame};
pub use manager::CoreManager;
pub use nic::{NetDevice, RingDevice};
pub use packet::{Packet, PacketPool};
pub use ring::{Ring, RingDirectory};
pub use shared_buffer::{SharedBuffer, Slot};
pub use status::{StatusReport, StatusSource};
