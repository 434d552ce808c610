// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Frame builder core.
//!
//! Turns assembled-but-unordered super-frames into consumer-ready ones:
//! zeroes the payload of any packets that never arrived, runs the
//! decoder's reorder pass into a spare slot and records the image size.

use crate::decoder::{ProtocolDecoder, ReorderTarget};
use crate::logging::{Facility, Logger};
use crate::ring::{self, Ring};
use crate::runtime::{ticks, ticks_per_sec};
use crate::shared_buffer::Slot;
use crate::status::{StatusReport, StatusSource};
use crate::worker::{CoreRefs, StageSpec, WorkerCore};
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

pub struct FrameBuilderStats {
    label: String,
    pub frames_built: AtomicU64,
    pub frames_built_hz: AtomicU64,
    pub idle_loops: AtomicU64,
    pub average_us_building: AtomicU64,
}

impl StatusSource for FrameBuilderStats {
    fn status(&self, report: &mut StatusReport, path: &str) {
        let prefix = format!("{}/{}", path, self.label);
        report.set_param(
            format!("{}/frames_built", prefix),
            self.frames_built.load(Ordering::Relaxed),
        );
        report.set_param(
            format!("{}/frames_built_hz", prefix),
            self.frames_built_hz.load(Ordering::Relaxed),
        );
        report.set_param(
            format!("{}/idle_loops", prefix),
            self.idle_loops.load(Ordering::Relaxed),
        );
        report.set_param(
            format!("{}/average_us_building", prefix),
            self.average_us_building.load(Ordering::Relaxed),
        );
    }
}

pub struct FrameBuilderCore {
    proc_idx: usize,
    socket_id: u32,
    stage: Arc<StageSpec>,
    decoder: Arc<dyn ProtocolDecoder>,
    rings: Arc<crate::worker::RingHub>,
    downstream_rings: Vec<Ring<Slot>>,
    clear_frames_ring: Option<Ring<Slot>>,
    upstream_ring: Option<Ring<Slot>>,
    run_lcore: Arc<AtomicBool>,
    stats: Arc<FrameBuilderStats>,
    logger: Logger,
}

impl FrameBuilderCore {
    pub fn new(proc_idx: usize, socket_id: u32, refs: CoreRefs) -> Result<Self> {
        let stage = refs.stage;
        let slot_ring_size = ring::nearest_power_of_two(refs.shared_buf.num_buffers());

        let mut downstream_rings = Vec::with_capacity(stage.num_downstream_cores);
        for ring_idx in 0..stage.num_downstream_cores {
            let name = ring::data_ring_name(&stage.config.core_name, ring_idx, socket_id);
            let (ring, created) = refs
                .rings
                .slots
                .lookup_or_create(&name, slot_ring_size)
                .with_context(|| format!("creating downstream ring {}", name))?;
            if created {
                refs.logger.info(
                    Facility::FrameBuilder,
                    &format!("created ring {} of size {}", name, slot_ring_size),
                );
            }
            downstream_rings.push(ring);
        }

        Ok(Self {
            proc_idx,
            socket_id,
            decoder: refs.decoder,
            rings: refs.rings,
            downstream_rings,
            clear_frames_ring: None,
            upstream_ring: None,
            run_lcore: Arc::new(AtomicBool::new(true)),
            stats: Arc::new(FrameBuilderStats {
                label: format!("{}_{}", stage.stage_name, proc_idx),
                frames_built: AtomicU64::new(0),
                frames_built_hz: AtomicU64::new(0),
                idle_loops: AtomicU64::new(0),
                average_us_building: AtomicU64::new(0),
            }),
            logger: refs.logger,
            stage,
        })
    }

    /// Zero the payload of every packet that never arrived, so stale bytes
    /// from a previous tenant of the slot cannot leak into the output.
    fn clear_missing_payload(&self, slot: &mut Slot) {
        let decoder = &self.decoder;
        let frames_per_super = decoder.frames_per_super_frame();
        let packets_per_sub = decoder.packets_per_sub_frame();
        let payload_size = decoder.payload_size();
        let image_off = decoder.image_data_offset();
        let sub_data_size = decoder.sub_frame_data_size();

        let bytes = slot.bytes_mut();
        for sub_idx in 0..frames_per_super {
            if decoder.packets_received(bytes, sub_idx) == packets_per_sub as u32 {
                continue;
            }
            for packet in 0..packets_per_sub {
                if !decoder.packet_received(bytes, sub_idx, packet) {
                    let off = image_off + sub_idx * sub_data_size + packet * payload_size;
                    bytes[off..off + payload_size].fill(0);
                }
            }
        }
    }
}

impl WorkerCore for FrameBuilderCore {
    fn core_name(&self) -> &'static str {
        "frame_builder"
    }

    fn socket_id(&self) -> u32 {
        self.socket_id
    }

    fn connect(&mut self) -> Result<()> {
        let upstream_core = self
            .stage
            .upstream_core_name
            .as_deref()
            .context("frame_builder has no upstream stage")?;
        let upstream_name = ring::data_ring_name(upstream_core, self.proc_idx, self.socket_id);
        self.upstream_ring = Some(
            self.rings
                .slots
                .lookup(&upstream_name)
                .with_context(|| format!("connecting to upstream ring {}", upstream_name))?,
        );

        let clear_name = ring::clear_frames_ring_name(self.socket_id);
        self.clear_frames_ring = Some(
            self.rings
                .slots
                .lookup(&clear_name)
                .with_context(|| format!("connecting to clear frames ring {}", clear_name))?,
        );

        self.logger.info(
            Facility::FrameBuilder,
            &format!(
                "{} : {} connected to upstream resources",
                self.stage.stage_name, self.proc_idx
            ),
        );
        Ok(())
    }

    fn run(&mut self, lcore_id: u32) {
        let decoder = Arc::clone(&self.decoder);
        let upstream = self.upstream_ring.clone().expect("connect() not called");
        let clear_frames = self.clear_frames_ring.clone().expect("connect() not called");

        let frames_per_super = decoder.frames_per_super_frame();
        let frame_size =
            decoder.x_resolution() * decoder.y_resolution() * decoder.bit_depth().bytes();
        let image_size = (frame_size * frames_per_super) as u64;

        self.logger.info(
            Facility::FrameBuilder,
            &format!("frame_builder core {} starting on lcore {}", self.proc_idx, lcore_id),
        );

        // Spare slot for the reorder pass, held for the lifetime of the core.
        let mut spare: Option<Slot> = None;
        while spare.is_none() && self.run_lcore.load(Ordering::Relaxed) {
            spare = clear_frames.dequeue();
        }

        let mut last = ticks();
        let mut frames_per_second: u64 = 0;
        let mut average_building_ticks: u64 = 0;

        while self.run_lcore.load(Ordering::Relaxed) {
            let now = ticks();
            if now - last >= ticks_per_sec() {
                self.stats
                    .frames_built_hz
                    .store(frames_per_second, Ordering::Relaxed);
                self.stats.average_us_building.store(
                    average_building_ticks / 1000,
                    Ordering::Relaxed,
                );
                frames_per_second = 0;
                average_building_ticks = 0;
                self.stats.idle_loops.store(0, Ordering::Relaxed);
                last = now;
            }

            let Some(mut input) = upstream.dequeue() else {
                self.stats.idle_loops.fetch_add(1, Ordering::Relaxed);
                continue;
            };

            let start_building = ticks();
            let super_frame_number = decoder.super_frame_number(input.bytes());

            let incomplete =
                frames_per_super as u32 - decoder.sub_frames_received(input.bytes());
            if incomplete > 0 {
                self.clear_missing_payload(&mut input);
                self.logger.info(
                    Facility::FrameBuilder,
                    &format!(
                        "got incomplete super frame {} with {} incomplete sub frames",
                        super_frame_number, incomplete
                    ),
                );
            }

            let mut workspace = spare.take().expect("spare slot held");
            let (mut built, next_spare) = match decoder.reorder(&mut input, &mut workspace) {
                ReorderTarget::Input => (input, workspace),
                ReorderTarget::Output => (workspace, input),
            };
            spare = Some(next_spare);

            decoder.set_super_frame_image_size(built.bytes_mut(), image_size);

            if self.downstream_rings.is_empty() {
                let _ = clear_frames.enqueue(built);
            } else {
                let idx =
                    (super_frame_number % self.downstream_rings.len() as u64) as usize;
                if let Err(slot) = self.downstream_rings[idx].enqueue(built) {
                    let _ = clear_frames.enqueue(slot);
                }
            }

            average_building_ticks =
                (average_building_ticks + (ticks() - start_building)) / 2;
            frames_per_second += 1;
            self.stats.frames_built.fetch_add(1, Ordering::Relaxed);
        }

        // Return the spare so shutdown conserves the slot population.
        if let Some(slot) = spare.take() {
            let _ = clear_frames.enqueue(slot);
        }

        self.logger.info(
            Facility::FrameBuilder,
            &format!("frame_builder core {} on lcore {} exiting", self.proc_idx, lcore_id),
        );
    }

    fn run_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.run_lcore)
    }

    fn stats(&self) -> Arc<dyn StatusSource> {
        Arc::clone(&self.stats) as Arc<dyn StatusSource>
    }
}
