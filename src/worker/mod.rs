// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Worker cores.
//!
//! Every pipeline stage is a [`WorkerCore`]: constructed at bootstrap,
//! wired to its upstream rings by `connect()`, then moved onto a dedicated
//! lcore where `run()` busy-polls until the shared run flag clears. Stage
//! classes register in an immutable name-keyed factory built at first use.

mod frame_builder;
mod frame_compressor;
mod frame_wrapper;
mod packet_processor;
mod packet_rx;

pub use frame_builder::FrameBuilderCore;
pub use frame_compressor::{byte_shuffle, byte_unshuffle, FrameCompressorCore};
pub use frame_wrapper::FrameWrapperCore;
pub use packet_processor::PacketProcessorCore;
pub use packet_rx::PacketRxCore;

use crate::config::{ConfigUpdate, WorkerCoreConfig};
use crate::decoder::ProtocolDecoder;
use crate::frame::FrameCallback;
use crate::logging::Logger;
use crate::nic::NetDevice;
use crate::packet::{Packet, PacketPool};
use crate::ring::RingDirectory;
use crate::shared_buffer::{SharedBuffer, Slot};
use crate::status::StatusSource;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, OnceLock};

/// The global ring namespace, shared by every core: packet rings (RX
/// fan-out, release) and slot rings (data rings, clear-frames free list).
#[derive(Default)]
pub struct RingHub {
    pub packets: RingDirectory<Packet>,
    pub slots: RingDirectory<Slot>,
}

impl RingHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// Resolved view of one stage of the graph, derived from the configuration
/// at bootstrap.
#[derive(Debug, Clone)]
pub struct StageSpec {
    /// Stage name: the key in the `worker_cores` table.
    pub stage_name: String,
    /// Raw per-stage configuration.
    pub config: WorkerCoreConfig,
    /// Worker class name of the upstream stage, if any.
    pub upstream_core_name: Option<String>,
    /// Derived consumer count for this stage's downstream rings.
    pub num_downstream_cores: usize,
}

/// Shared references handed to every worker core constructor.
#[derive(Clone)]
pub struct CoreRefs {
    pub stage: Arc<StageSpec>,
    pub decoder: Arc<dyn ProtocolDecoder>,
    pub shared_buf: Arc<SharedBuffer>,
    pub rings: Arc<RingHub>,
    pub device: Arc<dyn NetDevice>,
    pub packet_pool: Arc<PacketPool>,
    pub frame_callback: FrameCallback,
    pub logger: Logger,
}

/// One pipeline stage instance, bound to a socket and (once launched) to a
/// single lcore.
pub trait WorkerCore: Send {
    /// Worker class name (the factory key).
    fn core_name(&self) -> &'static str;

    /// Requested NUMA socket, or [`crate::runtime::SOCKET_ID_ANY`].
    fn socket_id(&self) -> u32;

    /// Resolve upstream rings by name. Called after every core has been
    /// constructed and before any is launched.
    fn connect(&mut self) -> Result<()>;

    /// The busy-poll loop. Runs on the assigned lcore until the run flag
    /// clears; must drain or drop in-flight work and return promptly.
    fn run(&mut self, lcore_id: u32);

    /// Cooperative cancellation flag checked at the loop head.
    fn run_flag(&self) -> Arc<AtomicBool>;

    /// Counter block published under the status surface.
    fn stats(&self) -> Arc<dyn StatusSource>;

    /// Control handle retained by the manager for runtime configuration
    /// updates; communicates with the running core through shared atomics.
    fn control(&self) -> Arc<dyn CoreControl> {
        Arc::new(NullControl)
    }
}

/// Runtime-update surface of a running core.
pub trait CoreControl: Send + Sync {
    fn apply_update(&self, update: &ConfigUpdate);
}

/// Control handle for cores with no runtime-updatable state.
pub struct NullControl;

impl CoreControl for NullControl {
    fn apply_update(&self, _update: &ConfigUpdate) {}
}

/// Worker core constructor signature used by the factory.
pub type CoreCtor = fn(proc_idx: usize, socket_id: u32, refs: CoreRefs) -> Result<Box<dyn WorkerCore>>;

/// Immutable worker class registry, populated once at first use.
pub fn core_registry() -> &'static HashMap<&'static str, CoreCtor> {
    static REGISTRY: OnceLock<HashMap<&'static str, CoreCtor>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut classes: HashMap<&'static str, CoreCtor> = HashMap::new();
        classes.insert("packet_rx", |idx, socket, refs| {
            Ok(Box::new(PacketRxCore::new(idx, socket, refs)?))
        });
        classes.insert("packet_processor", |idx, socket, refs| {
            Ok(Box::new(PacketProcessorCore::new(idx, socket, refs)?))
        });
        classes.insert("frame_builder", |idx, socket, refs| {
            Ok(Box::new(FrameBuilderCore::new(idx, socket, refs)?))
        });
        classes.insert("frame_compressor", |idx, socket, refs| {
            Ok(Box::new(FrameCompressorCore::new(idx, socket, refs)?))
        });
        classes.insert("frame_wrapper", |idx, socket, refs| {
            Ok(Box::new(FrameWrapperCore::new(idx, socket, refs)?))
        });
        classes
    })
}
