// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Frame wrapper core.
//!
//! The sole exit from the ring pipeline: dequeued super-frames are wrapped
//! in reference-counted [`SharedBufferFrame`] objects and handed to the
//! host callback. Slot reclamation happens through the wrapper frame's
//! drop, which posts the slot address back onto the clear-frames ring.

use crate::decoder::ProtocolDecoder;
use crate::frame::{CompressionType, FrameCallback, FrameMetaData, SharedBufferFrame};
use crate::logging::{Facility, Logger};
use crate::ring::{self, Ring};
use crate::runtime::{ticks, ticks_per_sec};
use crate::shared_buffer::Slot;
use crate::status::{StatusReport, StatusSource};
use crate::worker::{CoreRefs, StageSpec, WorkerCore};
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

pub struct FrameWrapperStats {
    label: String,
    pub frames_wrapped: AtomicU64,
    pub frames_wrapped_hz: AtomicU64,
    pub idle_loops: AtomicU64,
    pub average_us_wrapping: AtomicU64,
}

impl StatusSource for FrameWrapperStats {
    fn status(&self, report: &mut StatusReport, path: &str) {
        let prefix = format!("{}/{}", path, self.label);
        report.set_param(
            format!("{}/frames_wrapped", prefix),
            self.frames_wrapped.load(Ordering::Relaxed),
        );
        report.set_param(
            format!("{}/frames_wrapped_hz", prefix),
            self.frames_wrapped_hz.load(Ordering::Relaxed),
        );
        report.set_param(
            format!("{}/idle_loops", prefix),
            self.idle_loops.load(Ordering::Relaxed),
        );
        report.set_param(
            format!("{}/average_us_wrapping", prefix),
            self.average_us_wrapping.load(Ordering::Relaxed),
        );
    }
}

pub struct FrameWrapperCore {
    proc_idx: usize,
    socket_id: u32,
    stage: Arc<StageSpec>,
    decoder: Arc<dyn ProtocolDecoder>,
    rings: Arc<crate::worker::RingHub>,
    frame_callback: FrameCallback,
    clear_frames_ring: Option<Ring<Slot>>,
    upstream_ring: Option<Ring<Slot>>,
    run_lcore: Arc<AtomicBool>,
    stats: Arc<FrameWrapperStats>,
    logger: Logger,
}

impl FrameWrapperCore {
    pub fn new(proc_idx: usize, socket_id: u32, refs: CoreRefs) -> Result<Self> {
        let stage = refs.stage;
        Ok(Self {
            proc_idx,
            socket_id,
            decoder: refs.decoder,
            rings: refs.rings,
            frame_callback: refs.frame_callback,
            clear_frames_ring: None,
            upstream_ring: None,
            run_lcore: Arc::new(AtomicBool::new(true)),
            stats: Arc::new(FrameWrapperStats {
                label: format!("{}_{}", stage.stage_name, proc_idx),
                frames_wrapped: AtomicU64::new(0),
                frames_wrapped_hz: AtomicU64::new(0),
                idle_loops: AtomicU64::new(0),
                average_us_wrapping: AtomicU64::new(0),
            }),
            logger: refs.logger,
            stage,
        })
    }
}

impl WorkerCore for FrameWrapperCore {
    fn core_name(&self) -> &'static str {
        "frame_wrapper"
    }

    fn socket_id(&self) -> u32 {
        self.socket_id
    }

    fn connect(&mut self) -> Result<()> {
        let upstream_core = self
            .stage
            .upstream_core_name
            .as_deref()
            .context("frame_wrapper has no upstream stage")?;
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
            Facility::FrameWrapper,
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

        let dims = [decoder.x_resolution(), decoder.y_resolution()];
        let uncompressed_size = decoder.super_frame_data_size() as u64;
        let data_offset = decoder.image_data_offset();
        let dataset_name = self
            .stage
            .config
            .dataset_name
            .clone()
            .unwrap_or_else(|| "data".to_string());

        self.logger.info(
            Facility::FrameWrapper,
            &format!("frame_wrapper core {} starting on lcore {}", self.proc_idx, lcore_id),
        );

        let mut last = ticks();
        let mut frames_per_second: u64 = 0;
        let mut average_wrapping_ticks: u64 = 0;

        while self.run_lcore.load(Ordering::Relaxed) {
            let now = ticks();
            if now - last >= ticks_per_sec() {
                self.stats
                    .frames_wrapped_hz
                    .store(frames_per_second, Ordering::Relaxed);
                self.stats.average_us_wrapping.store(
                    average_wrapping_ticks / 1000,
                    Ordering::Relaxed,
                );
                frames_per_second = 0;
                average_wrapping_ticks = 0;
                self.stats.idle_loops.store(0, Ordering::Relaxed);
                last = now;
            }

            let Some(slot) = upstream.dequeue() else {
                self.stats.idle_loops.fetch_add(1, Ordering::Relaxed);
                continue;
            };

            let start_wrapping = ticks();
            let frame_number = decoder.super_frame_number(slot.bytes());
            let image_size = decoder.super_frame_image_size(slot.bytes());

            // Equal to the raw payload size means nothing compressed it on
            // the way here.
            let compression = if image_size == uncompressed_size {
                CompressionType::None
            } else {
                CompressionType::Lz4Block
            };

            let meta = FrameMetaData {
                dataset_name: dataset_name.clone(),
                frame_number,
                dimensions: dims,
                bit_depth: decoder.bit_depth(),
                compression,
            };

            let frame = SharedBufferFrame::new(
                meta,
                slot,
                clear_frames.clone(),
                data_offset,
                image_size,
            );
            (self.frame_callback)(frame);
            metrics::counter!("framepipe_frames_wrapped_total").increment(1);

            average_wrapping_ticks =
                (average_wrapping_ticks + (ticks() - start_wrapping)) / 2;
            frames_per_second += 1;
            self.stats.frames_wrapped.fetch_add(1, Ordering::Relaxed);
        }

        self.logger.info(
            Facility::FrameWrapper,
            &format!("frame_wrapper core {} on lcore {} exiting", self.proc_idx, lcore_id),
        );
    }

    fn run_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.run_lcore)
    }

    fn stats(&self) -> Arc<dyn StatusSource> {
        Arc::clone(&self.stats) as Arc<dyn StatusSource>
    }
}
