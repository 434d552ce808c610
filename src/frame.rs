// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Host-facing frame objects.
//!
//! [`SharedBufferFrame`] is the bridge between the ring-based pipeline and
//! the host plugin chain: it points at a shared-buffer slot and guarantees
//! that when the last reference is released the slot address re-enters the
//! clear-frames ring. That drop is the sole reclamation path for slots that
//! leave the pipeline.

use crate::decoder::BitDepth;
use crate::ring::Ring;
use crate::shared_buffer::Slot;
use std::sync::Arc;

/// How the image payload of a frame is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CompressionType {
    None,
    /// Block codec with optional byte shuffle (see the frame compressor).
    Lz4Block,
}

/// Metadata describing one wrapped super-frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMetaData {
    pub dataset_name: String,
    pub frame_number: u64,
    /// `[x_resolution, y_resolution]`
    pub dimensions: [usize; 2],
    pub bit_depth: BitDepth,
    pub compression: CompressionType,
}

/// A super-frame handed to the host callback.
///
/// The callback may retain the value (or an `Arc` of it) for as long as it
/// needs the bytes; dropping the last reference enqueues the slot back onto
/// the clear-frames ring exactly once.
pub struct SharedBufferFrame {
    meta: FrameMetaData,
    slot: Option<Slot>,
    clear_frames: Ring<Slot>,
    data_offset: usize,
    image_size: u64,
}

impl SharedBufferFrame {
    pub fn new(
        meta: FrameMetaData,
        slot: Slot,
        clear_frames: Ring<Slot>,
        data_offset: usize,
        image_size: u64,
    ) -> Self {
        Self {
            meta,
            slot: Some(slot),
            clear_frames,
            data_offset,
            image_size,
        }
    }

    pub fn meta(&self) -> &FrameMetaData {
        &self.meta
    }

    pub fn frame_number(&self) -> u64 {
        self.meta.frame_number
    }

    pub fn image_size(&self) -> u64 {
        self.image_size
    }

    pub fn set_image_size(&mut self, image_size: u64) {
        self.image_size = image_size;
    }

    /// The image payload bytes.
    pub fn data(&self) -> &[u8] {
        let slot = self.slot.as_ref().expect("slot present until drop");
        let end = (self.data_offset + self.image_size as usize).min(slot.len());
        &slot.bytes()[self.data_offset..end]
    }

    /// Raw slot bytes including the headers, for consumers that parse the
    /// super-frame header chain themselves.
    pub fn raw(&self) -> &[u8] {
        self.slot.as_ref().expect("slot present until drop").bytes()
    }
}

impl Drop for SharedBufferFrame {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            // Cannot fail: the clear-frames ring capacity covers every slot
            // in the arena.
            let _ = self.clear_frames.enqueue(slot);
        }
    }
}

/// Callback invoked by the frame wrapper for every super-frame leaving the
/// pipeline.
pub type FrameCallback = Arc<dyn Fn(SharedBufferFrame) + Send + Sync>;

/// A callback that drops every frame immediately, returning slots straight
/// to the free list.
pub fn discard_frames() -> FrameCallback {
    Arc::new(|_frame| {})
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::null_logger;
    use crate::ring::RingDirectory;
    use crate::shared_buffer::SharedBuffer;

    fn frame_fixture() -> (SharedBufferFrame, Ring<Slot>, Arc<SharedBuffer>) {
        let logger = null_logger();
        let shared = Arc::new(SharedBuffer::new(16 * 1024, 4096, 0, &logger).unwrap());
        let dir: RingDirectory<Slot> = RingDirectory::new();
        let (ring, _) = dir.lookup_or_create("clear_frames_0", 8).unwrap();

        let mut slot = shared.slot(0);
        slot.bytes_mut()[64..68].copy_from_slice(&[1, 2, 3, 4]);

        let meta = FrameMetaData {
            dataset_name: "data".to_string(),
            frame_number: 9,
            dimensions: [64, 64],
            bit_depth: BitDepth::Depth8,
            compression: CompressionType::None,
        };
        let frame = SharedBufferFrame::new(meta, slot, ring.clone(), 64, 4);
        (frame, ring, shared)
    }

    #[test]
    fn test_data_view() {
        let (frame, _ring, _shared) = frame_fixture();
        assert_eq!(frame.data(), &[1, 2, 3, 4]);
        assert_eq!(frame.frame_number(), 9);
    }

    #[test]
    fn test_drop_returns_slot_exactly_once() {
        let (frame, ring, shared) = frame_fixture();
        let addr = shared.address_of(0);
        assert_eq!(ring.len(), 0);
        drop(frame);
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.dequeue().unwrap().addr(), addr);
    }

    #[test]
    fn test_last_arc_reference_returns_slot() {
        let (frame, ring, _shared) = frame_fixture();
        let first = Arc::new(frame);
        let second = Arc::clone(&first);

        drop(first);
        assert_eq!(ring.len(), 0, "slot held while a reference remains");
        drop(second);
        assert_eq!(ring.len(), 1, "slot returned on last release");
    }
}
