// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Packet processor core.
//!
//! Assembles UDP packets into super-frames inside shared-buffer slots. A
//! packet's raw frame number is rebased against a latch captured from the
//! first packet seen, so the first super-frame observed by processor 0 is
//! super-frame 0 and subsequent super-frames distribute deterministically
//! across processors. Completed (or timed-out) slots are handed to the
//! downstream ring selected by `super_frame_number mod num_downstream`.
//!
//! When the clear-frames free list is empty, assembly for the new
//! super-frame diverts into a core-private scratch buffer which is never
//! enqueued; the super-frame is counted as dropped and the pipeline stays
//! live.

use crate::config::ConfigUpdate;
use crate::decoder::ProtocolDecoder;
use crate::logging::{Facility, Logger};
use crate::net;
use crate::packet::Packet;
use crate::ring::{self, Ring};
use crate::runtime::{ms_to_ticks, ticks, ticks_per_sec};
use crate::shared_buffer::Slot;
use crate::status::{StatusReport, StatusSource};
use crate::worker::{CoreControl, CoreRefs, StageSpec, WorkerCore};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

pub struct PacketProcessorStats {
    label: String,
    pub dropped_frames: AtomicU64,
    pub dropped_packets: AtomicU64,
    pub current_frame: AtomicI64,
    pub incomplete_frames: AtomicU64,
    pub complete_frames: AtomicU64,
    pub frames_complete_hz: AtomicU64,
}

impl StatusSource for PacketProcessorStats {
    fn status(&self, report: &mut StatusReport, path: &str) {
        let prefix = format!("{}/{}", path, self.label);
        report.set_param(
            format!("{}/dropped_frames", prefix),
            self.dropped_frames.load(Ordering::Relaxed),
        );
        report.set_param(
            format!("{}/dropped_packets", prefix),
            self.dropped_packets.load(Ordering::Relaxed),
        );
        report.set_param(
            format!("{}/current_frame", prefix),
            self.current_frame.load(Ordering::Relaxed),
        );
        report.set_param(
            format!("{}/frames_incomplete", prefix),
            self.incomplete_frames.load(Ordering::Relaxed),
        );
        report.set_param(
            format!("{}/frames_complete_total", prefix),
            self.complete_frames.load(Ordering::Relaxed),
        );
        report.set_param(
            format!("{}/frames_complete_hz", prefix),
            self.frames_complete_hz.load(Ordering::Relaxed),
        );
    }
}

/// Control handle: a configuration update with `proc_enable` set requests
/// a rebase, and the run loop re-anchors on the next observed packet.
struct ProcessorControl {
    anchor_reset: Arc<AtomicBool>,
}

impl CoreControl for ProcessorControl {
    fn apply_update(&self, update: &ConfigUpdate) {
        if update.proc_enable {
            self.anchor_reset.store(true, Ordering::Relaxed);
        }
    }
}

/// Where the packets of an in-progress super-frame are being written.
enum Tracked {
    /// A real slot acquired from the clear-frames ring.
    Building(Slot),
    /// Out of slots: packets divert to the scratch buffer.
    Dropped { start_ticks: u64 },
}

pub struct PacketProcessorCore {
    proc_idx: usize,
    socket_id: u32,
    stage: Arc<StageSpec>,
    decoder: Arc<dyn ProtocolDecoder>,
    rings: Arc<crate::worker::RingHub>,
    downstream_rings: Vec<Ring<Slot>>,
    clear_frames_ring: Ring<Slot>,
    upstream_ring: Option<Ring<Packet>>,
    release_ring: Option<Ring<Packet>>,
    anchor_reset: Arc<AtomicBool>,
    run_lcore: Arc<AtomicBool>,
    stats: Arc<PacketProcessorStats>,
    logger: Logger,
}

impl PacketProcessorCore {
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
                    Facility::PacketProcessor,
                    &format!("created ring {} of size {}", name, slot_ring_size),
                );
            }
            downstream_rings.push(ring);
        }

        // The first processor to boot on a socket creates the clear-frames
        // ring and seeds it with every slot of the shared buffer.
        let clear_name = ring::clear_frames_ring_name(socket_id);
        let (clear_frames_ring, created) = refs
            .rings
            .slots
            .lookup_or_create(&clear_name, slot_ring_size)
            .with_context(|| format!("creating clear frames ring {}", clear_name))?;
        if created {
            for element in 0..refs.shared_buf.num_buffers() {
                let _ = clear_frames_ring.enqueue(refs.shared_buf.slot(element));
            }
            refs.logger.info(
                Facility::PacketProcessor,
                &format!(
                    "created clear frames ring {} seeded with {} slots",
                    clear_name,
                    refs.shared_buf.num_buffers()
                ),
            );
        }

        Ok(Self {
            proc_idx,
            socket_id,
            decoder: refs.decoder,
            rings: refs.rings,
            downstream_rings,
            clear_frames_ring,
            upstream_ring: None,
            release_ring: None,
            anchor_reset: Arc::new(AtomicBool::new(false)),
            run_lcore: Arc::new(AtomicBool::new(true)),
            stats: Arc::new(PacketProcessorStats {
                label: format!("{}_{}", stage.stage_name, proc_idx),
                dropped_frames: AtomicU64::new(0),
                dropped_packets: AtomicU64::new(0),
                current_frame: AtomicI64::new(-1),
                incomplete_frames: AtomicU64::new(0),
                complete_frames: AtomicU64::new(0),
                frames_complete_hz: AtomicU64::new(0),
            }),
            logger: refs.logger,
            stage,
        })
    }

    /// Shared stats block for direct inspection in tests.
    pub fn stats_handle(&self) -> Arc<PacketProcessorStats> {
        Arc::clone(&self.stats)
    }

    fn enqueue_downstream(&self, super_frame_number: u64, slot: Slot) {
        if self.downstream_rings.is_empty() {
            // Terminal stage configuration: recycle immediately.
            let _ = self.clear_frames_ring.enqueue(slot);
            return;
        }
        let idx = (super_frame_number % self.downstream_rings.len() as u64) as usize;
        if let Err(slot) = self.downstream_rings[idx].enqueue(slot) {
            // Downstream rings are sized for the whole slot population, so
            // this only fires on a misconfigured graph; recycle the slot
            // rather than leak it.
            self.stats.dropped_frames.fetch_add(1, Ordering::Relaxed);
            let _ = self.clear_frames_ring.enqueue(slot);
        }
    }
}

impl WorkerCore for PacketProcessorCore {
    fn core_name(&self) -> &'static str {
        "packet_processor"
    }

    fn socket_id(&self) -> u32 {
        self.socket_id
    }

    fn connect(&mut self) -> Result<()> {
        let upstream_core = self
            .stage
            .upstream_core_name
            .as_deref()
            .context("packet_processor has no upstream stage")?;
        let upstream_name = ring::data_ring_name(upstream_core, self.proc_idx, self.socket_id);
        self.upstream_ring = Some(
            self.rings
                .packets
                .lookup(&upstream_name)
                .with_context(|| format!("connecting to upstream ring {}", upstream_name))?,
        );

        let release_name = ring::packet_release_ring_name(self.socket_id);
        self.release_ring = Some(
            self.rings
                .packets
                .lookup(&release_name)
                .with_context(|| format!("connecting to release ring {}", release_name))?,
        );

        self.logger.info(
            Facility::PacketProcessor,
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
        let release = self.release_ring.clone().expect("connect() not called");

        let frames_per_super = decoder.frames_per_super_frame() as u64;
        let packets_per_sub = decoder.packets_per_sub_frame();
        let payload_size = decoder.payload_size();
        let header_size = decoder.packet_header_size();
        let image_off = decoder.image_data_offset();
        let sub_data_size = decoder.sub_frame_data_size();
        let frame_timeout_ticks = ms_to_ticks(self.stage.config.frame_timeout);

        // Core-private scratch region for super-frames assembled while the
        // free list is empty.
        let mut scratch = vec![0u8; decoder.super_frame_buffer_size()].into_boxed_slice();

        let mut in_progress: HashMap<u64, Tracked> = HashMap::new();
        let mut current: Option<(u64, Tracked)> = None;
        let mut first_frame_number: Option<u64> = None;
        let mut last_sweep = ticks();
        let mut hz_counter: u64 = 0;

        self.logger.info(
            Facility::PacketProcessor,
            &format!(
                "packet_processor core {} starting on lcore {}",
                self.proc_idx, lcore_id
            ),
        );

        while self.run_lcore.load(Ordering::Relaxed) {
            if self.anchor_reset.swap(false, Ordering::Relaxed) {
                first_frame_number = None;
                self.logger.notice(
                    Facility::PacketProcessor,
                    &format!("{} : {} reset frame latch", self.stage.stage_name, self.proc_idx),
                );
            }

            if let Some(pkt) = upstream.dequeue() {
                let mut completed: Option<u64> = None;

                if let Ok(payload) = net::udp_payload(&pkt) {
                    if payload.len() >= header_size + payload_size {
                        let raw_frame_number = decoder.frame_number(payload);

                        // Rebase latch: the first observed packet anchors
                        // frame numbering so that this processor's share of
                        // super-frames starts at its own index.
                        let first = *first_frame_number.get_or_insert_with(|| {
                            let anchored = raw_frame_number
                                .wrapping_sub(self.proc_idx as u64 * frames_per_super);
                            self.logger.notice(
                                Facility::PacketProcessor,
                                &format!(
                                    "{} : {} updated frame latch to {}",
                                    self.stage.stage_name, self.proc_idx, anchored
                                ),
                            );
                            anchored
                        });

                        let frame_number = raw_frame_number.wrapping_sub(first);
                        let super_frame_number = frame_number / frames_per_super;
                        let sub_frame_idx = (frame_number % frames_per_super) as usize;
                        let packet_number = decoder.packet_number(payload) as usize;

                        if packet_number < packets_per_sub {
                            let switch = match &current {
                                Some((number, _)) => *number != super_frame_number,
                                None => true,
                            };
                            if switch {
                                if let Some((number, tracked)) = current.take() {
                                    in_progress.insert(number, tracked);
                                }
                                let tracked = match in_progress.remove(&super_frame_number) {
                                    Some(tracked) => tracked,
                                    None => match self.clear_frames_ring.dequeue() {
                                        Some(mut slot) => {
                                            let bytes = slot.bytes_mut();
                                            bytes[..image_off].fill(0);
                                            decoder.set_super_frame_number(
                                                bytes,
                                                super_frame_number,
                                            );
                                            decoder.set_super_frame_start_time(bytes, ticks());
                                            Tracked::Building(slot)
                                        }
                                        None => {
                                            self.stats
                                                .dropped_frames
                                                .fetch_add(1, Ordering::Relaxed);
                                            self.logger.warning(
                                                Facility::PacketProcessor,
                                                &format!(
                                                    "dropping super frame {}: no clear slots",
                                                    super_frame_number
                                                ),
                                            );
                                            Tracked::Dropped {
                                                start_ticks: ticks(),
                                            }
                                        }
                                    },
                                };
                                self.stats
                                    .current_frame
                                    .store(super_frame_number as i64, Ordering::Relaxed);
                                current = Some((super_frame_number, tracked));
                            }

                            let payload_src = &payload[header_size..header_size + payload_size];
                            let dst_off = image_off
                                + sub_frame_idx * sub_data_size
                                + packet_number * payload_size;

                            match current.as_mut().map(|(_, tracked)| tracked).unwrap() {
                                Tracked::Building(slot) => {
                                    let bytes = slot.bytes_mut();
                                    bytes[dst_off..dst_off + payload_size]
                                        .copy_from_slice(payload_src);

                                    if decoder.set_packet_received(
                                        bytes,
                                        sub_frame_idx,
                                        packet_number,
                                    ) {
                                        if decoder.packets_received(bytes, sub_frame_idx) == 1 {
                                            decoder.set_sub_frame_number(
                                                bytes,
                                                sub_frame_idx,
                                                frame_number,
                                            );
                                            decoder.set_sub_frame_start_time(
                                                bytes,
                                                sub_frame_idx,
                                                ticks(),
                                            );
                                        }
                                        if decoder.packets_received(bytes, sub_frame_idx)
                                            == packets_per_sub as u32
                                        {
                                            decoder.set_sub_frame_complete_time(
                                                bytes,
                                                sub_frame_idx,
                                                ticks(),
                                            );
                                            decoder.set_sub_frame_complete(bytes, sub_frame_idx);
                                        }
                                    }

                                    if decoder.sub_frames_received(bytes)
                                        == frames_per_super as u32
                                    {
                                        decoder.set_super_frame_complete_time(bytes, ticks());
                                        completed = Some(super_frame_number);
                                    }
                                }
                                Tracked::Dropped { .. } => {
                                    // Keep the write path identical for the
                                    // scratch case; the data goes nowhere.
                                    scratch[dst_off..dst_off + payload_size]
                                        .copy_from_slice(payload_src);
                                    self.stats.dropped_packets.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                        } else {
                            self.stats.dropped_packets.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }

                // The payload has been copied onwards; release the packet
                // buffer back to the RX core. A full release ring frees the
                // buffer in place by drop.
                let _ = release.enqueue(pkt);

                if let Some(number) = completed {
                    if let Some((_, Tracked::Building(slot))) = current.take() {
                        self.enqueue_downstream(number, slot);
                        self.stats.complete_frames.fetch_add(1, Ordering::Relaxed);
                        hz_counter += 1;
                    }
                    self.stats.current_frame.store(-1, Ordering::Relaxed);
                }
            }

            // Timeout sweep, roughly once per second.
            let now = ticks();
            if now - last_sweep >= ticks_per_sec() {
                self.stats
                    .frames_complete_hz
                    .store(hz_counter, Ordering::Relaxed);
                hz_counter = 0;

                // Fold the fast-path frame into the map so one pass covers
                // everything in progress.
                if let Some((number, tracked)) = current.take() {
                    in_progress.insert(number, tracked);
                    self.stats.current_frame.store(-1, Ordering::Relaxed);
                }

                let expired: Vec<u64> = in_progress
                    .iter()
                    .filter(|(_, tracked)| {
                        let start = match tracked {
                            Tracked::Building(slot) => {
                                decoder.super_frame_start_time(slot.bytes())
                            }
                            Tracked::Dropped { start_ticks } => *start_ticks,
                        };
                        now.saturating_sub(start) >= frame_timeout_ticks
                    })
                    .map(|(number, _)| *number)
                    .collect();

                for number in expired {
                    match in_progress.remove(&number) {
                        Some(Tracked::Building(slot)) => {
                            self.logger.info(
                                Facility::PacketProcessor,
                                &format!(
                                    "evicting super frame {} with {} complete sub frames",
                                    number,
                                    decoder.sub_frames_received(slot.bytes())
                                ),
                            );
                            self.enqueue_downstream(number, slot);
                            self.stats.incomplete_frames.fetch_add(1, Ordering::Relaxed);
                        }
                        Some(Tracked::Dropped { .. }) => {
                            // Scratch super-frame ends silently; it was
                            // already counted when the slots ran out.
                        }
                        None => {}
                    }
                }

                last_sweep = now;
            }
        }

        self.logger.info(
            Facility::PacketProcessor,
            &format!(
                "packet_processor core {} on lcore {} exiting",
                self.proc_idx, lcore_id
            ),
        );
    }

    fn run_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.run_lcore)
    }

    fn stats(&self) -> Arc<dyn StatusSource> {
        Arc::clone(&self.stats) as Arc<dyn StatusSource>
    }

    fn control(&self) -> Arc<dyn CoreControl> {
        Arc::new(ProcessorControl {
            anchor_reset: Arc::clone(&self.anchor_reset),
        })
    }
}
