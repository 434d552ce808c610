// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Frame compressor core.
//!
//! Compresses super-frame payloads with the LZ4 block codec, optionally
//! preceded by a type-width-aware byte shuffle that groups the bytes of
//! each sample plane together (the usual trick for detector data, where
//! high bytes vary slowly). Headers are copied verbatim into the output
//! slot and the compressed size recorded so downstream consumers can tell
//! compressed frames from raw ones.

use crate::decoder::ProtocolDecoder;
use crate::logging::{Facility, Logger};
use crate::ring::{self, Ring};
use crate::runtime::{ticks, ticks_per_sec};
use crate::shared_buffer::Slot;
use crate::status::{StatusReport, StatusSource};
use crate::worker::{CoreRefs, StageSpec, WorkerCore};
use anyhow::{bail, Context, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Byte shuffle: scatter each element's bytes into per-plane groups.
/// `element_size` of 1 is the identity.
pub fn byte_shuffle(input: &[u8], output: &mut [u8], element_size: usize) {
    debug_assert_eq!(input.len(), output.len());
    debug_assert_eq!(input.len() % element_size, 0);
    if element_size <= 1 {
        output.copy_from_slice(input);
        return;
    }
    let elements = input.len() / element_size;
    for plane in 0..element_size {
        for elem in 0..elements {
            output[plane * elements + elem] = input[elem * element_size + plane];
        }
    }
}

/// Inverse of [`byte_shuffle`].
pub fn byte_unshuffle(input: &[u8], output: &mut [u8], element_size: usize) {
    debug_assert_eq!(input.len(), output.len());
    debug_assert_eq!(input.len() % element_size, 0);
    if element_size <= 1 {
        output.copy_from_slice(input);
        return;
    }
    let elements = input.len() / element_size;
    for plane in 0..element_size {
        for elem in 0..elements {
            output[elem * element_size + plane] = input[plane * elements + elem];
        }
    }
}

pub struct FrameCompressorStats {
    label: String,
    pub frames_compressed: AtomicU64,
    pub frames_compressed_hz: AtomicU64,
    pub idle_loops: AtomicU64,
    pub average_us_compressing: AtomicU64,
}

impl StatusSource for FrameCompressorStats {
    fn status(&self, report: &mut StatusReport, path: &str) {
        let prefix = format!("{}/{}", path, self.label);
        report.set_param(
            format!("{}/frames_compressed", prefix),
            self.frames_compressed.load(Ordering::Relaxed),
        );
        report.set_param(
            format!("{}/frames_compressed_hz", prefix),
            self.frames_compressed_hz.load(Ordering::Relaxed),
        );
        report.set_param(
            format!("{}/idle_loops", prefix),
            self.idle_loops.load(Ordering::Relaxed),
        );
        report.set_param(
            format!("{}/average_us_compressing", prefix),
            self.average_us_compressing.load(Ordering::Relaxed),
        );
    }
}

pub struct FrameCompressorCore {
    proc_idx: usize,
    socket_id: u32,
    stage: Arc<StageSpec>,
    decoder: Arc<dyn ProtocolDecoder>,
    rings: Arc<crate::worker::RingHub>,
    downstream_rings: Vec<Ring<Slot>>,
    clear_frames_ring: Option<Ring<Slot>>,
    upstream_ring: Option<Ring<Slot>>,
    run_lcore: Arc<AtomicBool>,
    stats: Arc<FrameCompressorStats>,
    logger: Logger,
}

impl FrameCompressorCore {
    pub fn new(proc_idx: usize, socket_id: u32, refs: CoreRefs) -> Result<Self> {
        let stage = refs.stage;
        if stage.config.compress_codec != "lz4" {
            bail!(
                "frame_compressor '{}' requires the lz4 codec, got '{}'",
                stage.stage_name,
                stage.config.compress_codec
            );
        }

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
                    Facility::FrameCompressor,
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
            stats: Arc::new(FrameCompressorStats {
                label: format!("{}_{}", stage.stage_name, proc_idx),
                frames_compressed: AtomicU64::new(0),
                frames_compressed_hz: AtomicU64::new(0),
                idle_loops: AtomicU64::new(0),
                average_us_compressing: AtomicU64::new(0),
            }),
            logger: refs.logger,
            stage,
        })
    }
}

impl WorkerCore for FrameCompressorCore {
    fn core_name(&self) -> &'static str {
        "frame_compressor"
    }

    fn socket_id(&self) -> u32 {
        self.socket_id
    }

    fn connect(&mut self) -> Result<()> {
        let upstream_core = self
            .stage
            .upstream_core_name
            .as_deref()
            .context("frame_compressor has no upstream stage")?;
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
            Facility::FrameCompressor,
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

        let image_off = decoder.image_data_offset();
        let data_size = decoder.super_frame_data_size();
        let element_size = decoder.bit_depth().bytes();
        let level = self.stage.config.compress_level;
        let shuffle = self.stage.config.compress_shuffle != 0;

        // Scratch for the shuffle pass, allocated once.
        let mut shuffled = if shuffle {
            vec![0u8; data_size].into_boxed_slice()
        } else {
            Box::default()
        };

        self.logger.info(
            Facility::FrameCompressor,
            &format!(
                "frame_compressor core {} starting on lcore {} (level {}, shuffle {})",
                self.proc_idx, lcore_id, level, shuffle
            ),
        );

        // Output slot for the compressed stream, swapped with the input
        // slot after every frame.
        let mut output: Option<Slot> = None;
        while output.is_none() && self.run_lcore.load(Ordering::Relaxed) {
            output = clear_frames.dequeue();
        }

        let mut last = ticks();
        let mut frames_per_second: u64 = 0;
        let mut average_compression_ticks: u64 = 0;

        while self.run_lcore.load(Ordering::Relaxed) {
            let now = ticks();
            if now - last >= ticks_per_sec() {
                self.stats
                    .frames_compressed_hz
                    .store(frames_per_second, Ordering::Relaxed);
                self.stats.average_us_compressing.store(
                    average_compression_ticks / 1000,
                    Ordering::Relaxed,
                );
                frames_per_second = 0;
                average_compression_ticks = 0;
                self.stats.idle_loops.store(0, Ordering::Relaxed);
                last = now;
            }

            let Some(input) = upstream.dequeue() else {
                self.stats.idle_loops.fetch_add(1, Ordering::Relaxed);
                continue;
            };

            let start_compressing = ticks();
            let super_frame_number = decoder.super_frame_number(input.bytes());
            let mut out_slot = output.take().expect("output slot held");

            let compressed_size = {
                let in_bytes = input.bytes();
                let out_bytes = out_slot.bytes_mut();
                let src = &in_bytes[image_off..image_off + data_size];
                let dst = &mut out_bytes[image_off..];

                if level == 0 {
                    // Level 0 passes the payload through untouched; the
                    // wrapper will classify the frame as uncompressed.
                    dst[..data_size].copy_from_slice(src);
                    data_size
                } else if shuffle {
                    byte_shuffle(src, &mut shuffled, element_size);
                    lz4_flex::block::compress_into(&shuffled, dst).unwrap_or_else(|_| {
                        dst[..data_size].copy_from_slice(src);
                        data_size
                    })
                } else {
                    lz4_flex::block::compress_into(src, dst).unwrap_or_else(|_| {
                        dst[..data_size].copy_from_slice(src);
                        data_size
                    })
                }
            };

            // Header block copied verbatim, then the real image size.
            out_slot.bytes_mut()[..image_off].copy_from_slice(&input.bytes()[..image_off]);
            decoder.set_super_frame_image_size(out_slot.bytes_mut(), compressed_size as u64);

            if self.downstream_rings.is_empty() {
                let _ = clear_frames.enqueue(out_slot);
            } else {
                let idx =
                    (super_frame_number % self.downstream_rings.len() as u64) as usize;
                if let Err(slot) = self.downstream_rings[idx].enqueue(out_slot) {
                    let _ = clear_frames.enqueue(slot);
                }
            }

            // The input slot becomes the next output.
            output = Some(input);

            average_compression_ticks =
                (average_compression_ticks + (ticks() - start_compressing)) / 2;
            frames_per_second += 1;
            self.stats.frames_compressed.fetch_add(1, Ordering::Relaxed);
        }

        if let Some(slot) = output.take() {
            let _ = clear_frames.enqueue(slot);
        }

        self.logger.info(
            Facility::FrameCompressor,
            &format!(
                "frame_compressor core {} on lcore {} exiting",
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shuffle_roundtrip_u16() {
        let input: Vec<u8> = (0u8..32).collect();
        let mut shuffled = vec![0u8; 32];
        let mut restored = vec![0u8; 32];

        byte_shuffle(&input, &mut shuffled, 2);
        byte_unshuffle(&shuffled, &mut restored, 2);

        assert_eq!(input, restored);
        // Low bytes of the 16 elements come first after the shuffle.
        assert_eq!(shuffled[0], 0);
        assert_eq!(shuffled[1], 2);
        assert_eq!(shuffled[16], 1);
    }

    #[test]
    fn test_shuffle_width_one_is_identity() {
        let input = [5u8, 4, 3, 2];
        let mut output = [0u8; 4];
        byte_shuffle(&input, &mut output, 1);
        assert_eq!(input, output);
    }

    #[test]
    fn test_compress_roundtrip_with_shuffle() {
        // Slowly-varying 16-bit samples: shuffle groups the constant high
        // bytes so the block codec can collapse them.
        let samples: Vec<u8> = (0..4096u16)
            .flat_map(|v| ((v / 8) + 0x4000).to_le_bytes())
            .collect();

        let mut shuffled = vec![0u8; samples.len()];
        byte_shuffle(&samples, &mut shuffled, 2);

        let compressed = lz4_flex::block::compress(&shuffled);
        assert!(compressed.len() < samples.len());

        let decompressed =
            lz4_flex::block::decompress(&compressed, samples.len()).expect("decompress");
        let mut restored = vec![0u8; samples.len()];
        byte_unshuffle(&decompressed, &mut restored, 2);
        assert_eq!(samples, restored);
    }
}
