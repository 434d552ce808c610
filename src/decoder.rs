// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Protocol decoder capability.
//!
//! The pipeline is detector-agnostic: everything it knows about the wire
//! protocol and the in-slot super-frame layout it learns through a
//! [`ProtocolDecoder`] held by reference. Header accessors operate on byte
//! slices within a shared-buffer slot so the decoder stays free of any
//! buffer-ownership concerns.
//!
//! [`GridDecoder`] is the reference implementation: a plain little-endian
//! packet header and a fixed `SuperFrameHeader | N x SubFrameHeader |
//! payload` slot layout.

use crate::shared_buffer::Slot;

/// Pixel sample width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BitDepth {
    Depth8,
    Depth16,
    Depth32,
}

impl BitDepth {
    pub const fn bytes(self) -> usize {
        match self {
            BitDepth::Depth8 => 1,
            BitDepth::Depth16 => 2,
            BitDepth::Depth32 => 4,
        }
    }
}

/// Which of the two slots passed to [`ProtocolDecoder::reorder`] holds the
/// reordered super-frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorderTarget {
    Input,
    Output,
}

/// Detector protocol knowledge consumed by the pipeline cores.
///
/// `slot` arguments are the full byte region of a shared-buffer slot laid
/// out by this decoder; `pkt_hdr` arguments are the leading bytes of a UDP
/// payload.
pub trait ProtocolDecoder: Send + Sync {
    // Geometry
    fn frames_per_super_frame(&self) -> usize;
    fn packets_per_sub_frame(&self) -> usize;
    fn payload_size(&self) -> usize;
    fn packet_header_size(&self) -> usize;
    fn sub_frame_header_size(&self) -> usize;
    fn super_frame_header_size(&self) -> usize;
    fn super_frame_buffer_size(&self) -> usize;
    fn x_resolution(&self) -> usize;
    fn y_resolution(&self) -> usize;
    fn bit_depth(&self) -> BitDepth;

    /// Payload bytes of one sub-frame.
    fn sub_frame_data_size(&self) -> usize {
        self.packets_per_sub_frame() * self.payload_size()
    }

    /// Payload bytes of one super-frame.
    fn super_frame_data_size(&self) -> usize {
        self.sub_frame_data_size() * self.frames_per_super_frame()
    }

    /// Offset of the image payload region within a slot.
    fn image_data_offset(&self) -> usize {
        self.super_frame_header_size()
            + self.frames_per_super_frame() * self.sub_frame_header_size()
    }

    // Packet header accessors
    fn frame_number(&self, pkt_hdr: &[u8]) -> u64;
    fn packet_number(&self, pkt_hdr: &[u8]) -> u32;

    // Super-frame header accessors
    fn super_frame_number(&self, slot: &[u8]) -> u64;
    fn set_super_frame_number(&self, slot: &mut [u8], value: u64);
    fn super_frame_start_time(&self, slot: &[u8]) -> u64;
    fn set_super_frame_start_time(&self, slot: &mut [u8], value: u64);
    fn super_frame_complete_time(&self, slot: &[u8]) -> u64;
    fn set_super_frame_complete_time(&self, slot: &mut [u8], value: u64);
    fn super_frame_image_size(&self, slot: &[u8]) -> u64;
    fn set_super_frame_image_size(&self, slot: &mut [u8], value: u64);

    /// Count of complete sub-frames.
    fn sub_frames_received(&self, slot: &[u8]) -> u32;
    /// Whether sub-frame `sub_frame_idx` is marked complete.
    fn sub_frame_complete(&self, slot: &[u8], sub_frame_idx: usize) -> bool;
    /// Mark sub-frame `sub_frame_idx` complete. Returns false when the index
    /// is out of range or the bit was already set.
    fn set_sub_frame_complete(&self, slot: &mut [u8], sub_frame_idx: usize) -> bool;

    // Sub-frame header accessors
    fn sub_frame_number(&self, slot: &[u8], sub_frame_idx: usize) -> u64;
    fn set_sub_frame_number(&self, slot: &mut [u8], sub_frame_idx: usize, value: u64);
    fn sub_frame_start_time(&self, slot: &[u8], sub_frame_idx: usize) -> u64;
    fn set_sub_frame_start_time(&self, slot: &mut [u8], sub_frame_idx: usize, value: u64);
    fn sub_frame_complete_time(&self, slot: &[u8], sub_frame_idx: usize) -> u64;
    fn set_sub_frame_complete_time(&self, slot: &mut [u8], sub_frame_idx: usize, value: u64);

    /// Packets received so far for a sub-frame.
    fn packets_received(&self, slot: &[u8], sub_frame_idx: usize) -> u32;
    /// Packets still missing for a sub-frame.
    fn packets_dropped(&self, slot: &[u8], sub_frame_idx: usize) -> u32 {
        self.packets_per_sub_frame() as u32 - self.packets_received(slot, sub_frame_idx)
    }
    /// Whether a given packet of a sub-frame has been received.
    fn packet_received(&self, slot: &[u8], sub_frame_idx: usize, packet_number: usize) -> bool;
    /// Mark a packet received. Returns false when the packet number is out
    /// of range or the bit was already set.
    fn set_packet_received(
        &self,
        slot: &mut [u8],
        sub_frame_idx: usize,
        packet_number: usize,
    ) -> bool;

    /// Reorder `input` into consumer layout, using `output` as workspace.
    /// Returns which slot holds the reordered super-frame.
    fn reorder(&self, input: &mut Slot, output: &mut Slot) -> ReorderTarget;
}

/// Geometry parameters for [`GridDecoder`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GridGeometry {
    pub x_resolution: usize,
    pub y_resolution: usize,
    pub bit_depth: BitDepth,
    pub frames_per_super_frame: usize,
    pub packets_per_sub_frame: usize,
    pub payload_size: usize,
}

impl GridGeometry {
    /// Validate internal consistency: a sub-frame's packets must carry
    /// exactly one image of the configured resolution.
    pub fn validate(&self) -> Result<(), String> {
        if self.frames_per_super_frame == 0
            || self.packets_per_sub_frame == 0
            || self.payload_size == 0
        {
            return Err("geometry fields must be non-zero".to_string());
        }
        let image = self.x_resolution * self.y_resolution * self.bit_depth.bytes();
        let carried = self.packets_per_sub_frame * self.payload_size;
        if image != carried {
            return Err(format!(
                "image size {} does not match sub-frame payload {} ({} packets x {} bytes)",
                image, carried, self.packets_per_sub_frame, self.payload_size
            ));
        }
        Ok(())
    }
}

// GridDecoder in-slot layout, all fields little-endian:
//
//   SuperFrameHeader:
//     0   super_frame_number   u64
//     8   start_time           u64
//     16  complete_time        u64
//     24  image_size           u64
//     32  sub_frames_received  u32
//     36  (pad)
//     40  sub-frame bitmap     ceil(N/8) bytes, padded to 8
//
//   SubFrameHeader (per sub-frame):
//     0   frame_number         u64
//     8   start_time           u64
//     16  complete_time        u64
//     24  packets_received     u32
//     28  (pad)
//     32  packet bitmap        ceil(P/8) bytes, padded to 8
const SUPER_FIXED: usize = 40;
const SUB_FIXED: usize = 32;

const OFF_SUPER_NUMBER: usize = 0;
const OFF_SUPER_START: usize = 8;
const OFF_SUPER_COMPLETE: usize = 16;
const OFF_SUPER_IMAGE_SIZE: usize = 24;
const OFF_SUPER_RECEIVED: usize = 32;
const OFF_SUPER_BITMAP: usize = 40;

const OFF_SUB_NUMBER: usize = 0;
const OFF_SUB_START: usize = 8;
const OFF_SUB_COMPLETE: usize = 16;
const OFF_SUB_RECEIVED: usize = 24;
const OFF_SUB_BITMAP: usize = 32;

fn align8(value: usize) -> usize {
    (value + 7) & !7
}

#[inline]
fn read_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

#[inline]
fn write_u64(buf: &mut [u8], off: usize, value: u64) {
    buf[off..off + 8].copy_from_slice(&value.to_le_bytes());
}

#[inline]
fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

#[inline]
fn write_u32(buf: &mut [u8], off: usize, value: u32) {
    buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

/// Reference decoder for the plain grid detector format.
///
/// Packet header: `frame_number: u64 LE | packet_number: u32 LE | pad: u32`.
/// Payload arrives in raster order, so `reorder` is an identity pass.
pub struct GridDecoder {
    geometry: GridGeometry,
    sub_header_size: usize,
    super_header_size: usize,
}

/// Wire packet header bytes.
pub const GRID_PACKET_HEADER_SIZE: usize = 16;

impl GridDecoder {
    pub fn new(geometry: GridGeometry) -> Result<Self, String> {
        geometry.validate()?;
        let sub_bitmap = geometry.packets_per_sub_frame.div_ceil(8);
        let super_bitmap = geometry.frames_per_super_frame.div_ceil(8);
        Ok(Self {
            sub_header_size: align8(SUB_FIXED + sub_bitmap),
            super_header_size: align8(SUPER_FIXED + super_bitmap),
            geometry,
        })
    }

    /// Encode a packet header for this format (test traffic, simulators).
    pub fn encode_packet_header(frame_number: u64, packet_number: u32) -> [u8; GRID_PACKET_HEADER_SIZE] {
        let mut hdr = [0u8; GRID_PACKET_HEADER_SIZE];
        hdr[0..8].copy_from_slice(&frame_number.to_le_bytes());
        hdr[8..12].copy_from_slice(&packet_number.to_le_bytes());
        hdr
    }

    #[inline]
    fn sub_off(&self, sub_frame_idx: usize) -> usize {
        self.super_header_size + sub_frame_idx * self.sub_header_size
    }
}

impl ProtocolDecoder for GridDecoder {
    fn frames_per_super_frame(&self) -> usize {
        self.geometry.frames_per_super_frame
    }

    fn packets_per_sub_frame(&self) -> usize {
        self.geometry.packets_per_sub_frame
    }

    fn payload_size(&self) -> usize {
        self.geometry.payload_size
    }

    fn packet_header_size(&self) -> usize {
        GRID_PACKET_HEADER_SIZE
    }

    fn sub_frame_header_size(&self) -> usize {
        self.sub_header_size
    }

    fn super_frame_header_size(&self) -> usize {
        self.super_header_size
    }

    fn super_frame_buffer_size(&self) -> usize {
        // Headers + payload + block-codec worst-case expansion headroom, so
        // a compressed super-frame always fits in a slot.
        let data = self.super_frame_data_size();
        align8(self.image_data_offset() + data + data / 255 + 16)
    }

    fn x_resolution(&self) -> usize {
        self.geometry.x_resolution
    }

    fn y_resolution(&self) -> usize {
        self.geometry.y_resolution
    }

    fn bit_depth(&self) -> BitDepth {
        self.geometry.bit_depth
    }

    fn frame_number(&self, pkt_hdr: &[u8]) -> u64 {
        read_u64(pkt_hdr, 0)
    }

    fn packet_number(&self, pkt_hdr: &[u8]) -> u32 {
        read_u32(pkt_hdr, 8)
    }

    fn super_frame_number(&self, slot: &[u8]) -> u64 {
        read_u64(slot, OFF_SUPER_NUMBER)
    }

    fn set_super_frame_number(&self, slot: &mut [u8], value: u64) {
        write_u64(slot, OFF_SUPER_NUMBER, value);
    }

    fn super_frame_start_time(&self, slot: &[u8]) -> u64 {
        read_u64(slot, OFF_SUPER_START)
    }

    fn set_super_frame_start_time(&self, slot: &mut [u8], value: u64) {
        write_u64(slot, OFF_SUPER_START, value);
    }

    fn super_frame_complete_time(&self, slot: &[u8]) -> u64 {
        read_u64(slot, OFF_SUPER_COMPLETE)
    }

    fn set_super_frame_complete_time(&self, slot: &mut [u8], value: u64) {
        write_u64(slot, OFF_SUPER_COMPLETE, value);
    }

    fn super_frame_image_size(&self, slot: &[u8]) -> u64 {
        read_u64(slot, OFF_SUPER_IMAGE_SIZE)
    }

    fn set_super_frame_image_size(&self, slot: &mut [u8], value: u64) {
        write_u64(slot, OFF_SUPER_IMAGE_SIZE, value);
    }

    fn sub_frames_received(&self, slot: &[u8]) -> u32 {
        read_u32(slot, OFF_SUPER_RECEIVED)
    }

    fn sub_frame_complete(&self, slot: &[u8], sub_frame_idx: usize) -> bool {
        if sub_frame_idx >= self.geometry.frames_per_super_frame {
            return false;
        }
        slot[OFF_SUPER_BITMAP + sub_frame_idx / 8] & (1 << (sub_frame_idx % 8)) != 0
    }

    fn set_sub_frame_complete(&self, slot: &mut [u8], sub_frame_idx: usize) -> bool {
        if sub_frame_idx >= self.geometry.frames_per_super_frame {
            return false;
        }
        let byte = OFF_SUPER_BITMAP + sub_frame_idx / 8;
        let mask = 1u8 << (sub_frame_idx % 8);
        if slot[byte] & mask != 0 {
            return false;
        }
        slot[byte] |= mask;
        let received = read_u32(slot, OFF_SUPER_RECEIVED) + 1;
        write_u32(slot, OFF_SUPER_RECEIVED, received);
        true
    }

    fn sub_frame_number(&self, slot: &[u8], sub_frame_idx: usize) -> u64 {
        read_u64(slot, self.sub_off(sub_frame_idx) + OFF_SUB_NUMBER)
    }

    fn set_sub_frame_number(&self, slot: &mut [u8], sub_frame_idx: usize, value: u64) {
        let off = self.sub_off(sub_frame_idx);
        write_u64(slot, off + OFF_SUB_NUMBER, value);
    }

    fn sub_frame_start_time(&self, slot: &[u8], sub_frame_idx: usize) -> u64 {
        read_u64(slot, self.sub_off(sub_frame_idx) + OFF_SUB_START)
    }

    fn set_sub_frame_start_time(&self, slot: &mut [u8], sub_frame_idx: usize, value: u64) {
        let off = self.sub_off(sub_frame_idx);
        write_u64(slot, off + OFF_SUB_START, value);
    }

    fn sub_frame_complete_time(&self, slot: &[u8], sub_frame_idx: usize) -> u64 {
        read_u64(slot, self.sub_off(sub_frame_idx) + OFF_SUB_COMPLETE)
    }

    fn set_sub_frame_complete_time(&self, slot: &mut [u8], sub_frame_idx: usize, value: u64) {
        let off = self.sub_off(sub_frame_idx);
        write_u64(slot, off + OFF_SUB_COMPLETE, value);
    }

    fn packets_received(&self, slot: &[u8], sub_frame_idx: usize) -> u32 {
        read_u32(slot, self.sub_off(sub_frame_idx) + OFF_SUB_RECEIVED)
    }

    fn packet_received(&self, slot: &[u8], sub_frame_idx: usize, packet_number: usize) -> bool {
        if packet_number >= self.geometry.packets_per_sub_frame {
            return false;
        }
        let off = self.sub_off(sub_frame_idx) + OFF_SUB_BITMAP;
        slot[off + packet_number / 8] & (1 << (packet_number % 8)) != 0
    }

    fn set_packet_received(
        &self,
        slot: &mut [u8],
        sub_frame_idx: usize,
        packet_number: usize,
    ) -> bool {
        if packet_number >= self.geometry.packets_per_sub_frame {
            return false;
        }
        let sub = self.sub_off(sub_frame_idx);
        let byte = sub + OFF_SUB_BITMAP + packet_number / 8;
        let mask = 1u8 << (packet_number % 8);
        if slot[byte] & mask != 0 {
            return false;
        }
        slot[byte] |= mask;
        let received = read_u32(slot, sub + OFF_SUB_RECEIVED) + 1;
        write_u32(slot, sub + OFF_SUB_RECEIVED, received);
        true
    }

    fn reorder(&self, input: &mut Slot, _output: &mut Slot) -> ReorderTarget {
        // Grid payload arrives in raster order; nothing to rearrange.
        ReorderTarget::Input
    }
}

#[cfg(test)]
pub(crate) fn test_geometry() -> GridGeometry {
    GridGeometry {
        x_resolution: 64,
        y_resolution: 64,
        bit_depth: BitDepth::Depth8,
        frames_per_super_frame: 4,
        packets_per_sub_frame: 4,
        payload_size: 1024,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder() -> GridDecoder {
        GridDecoder::new(test_geometry()).unwrap()
    }

    #[test]
    fn test_geometry_validation() {
        let mut geom = test_geometry();
        assert!(geom.validate().is_ok());
        geom.payload_size = 1000;
        assert!(geom.validate().is_err());
    }

    #[test]
    fn test_packet_header_roundtrip() {
        let d = decoder();
        let hdr = GridDecoder::encode_packet_header(123456789, 3);
        assert_eq!(d.frame_number(&hdr), 123456789);
        assert_eq!(d.packet_number(&hdr), 3);
    }

    #[test]
    fn test_layout_sizes() {
        let d = decoder();
        // 4 sub-frames: 1-byte bitmaps, aligned to 8.
        assert_eq!(d.sub_frame_header_size(), 40);
        assert_eq!(d.super_frame_header_size(), 48);
        assert_eq!(d.image_data_offset(), 48 + 4 * 40);
        assert_eq!(d.super_frame_data_size(), 4 * 4 * 1024);
        assert!(d.super_frame_buffer_size() >= d.image_data_offset() + d.super_frame_data_size());
    }

    #[test]
    fn test_super_frame_header_fields() {
        let d = decoder();
        let mut slot = vec![0u8; d.super_frame_buffer_size()];
        d.set_super_frame_number(&mut slot, 42);
        d.set_super_frame_start_time(&mut slot, 1000);
        d.set_super_frame_complete_time(&mut slot, 2000);
        d.set_super_frame_image_size(&mut slot, 16384);

        assert_eq!(d.super_frame_number(&slot), 42);
        assert_eq!(d.super_frame_start_time(&slot), 1000);
        assert_eq!(d.super_frame_complete_time(&slot), 2000);
        assert_eq!(d.super_frame_image_size(&slot), 16384);
    }

    #[test]
    fn test_packet_bitmap_and_counters() {
        let d = decoder();
        let mut slot = vec![0u8; d.super_frame_buffer_size()];

        assert!(!d.packet_received(&slot, 1, 2));
        assert!(d.set_packet_received(&mut slot, 1, 2));
        assert!(d.packet_received(&slot, 1, 2));
        assert_eq!(d.packets_received(&slot, 1), 1);
        assert_eq!(d.packets_dropped(&slot, 1), 3);

        // Duplicate packets must not double count.
        assert!(!d.set_packet_received(&mut slot, 1, 2));
        assert_eq!(d.packets_received(&slot, 1), 1);

        // Out-of-range packet number is rejected.
        assert!(!d.set_packet_received(&mut slot, 1, 4));

        // A neighbouring sub-frame is unaffected.
        assert_eq!(d.packets_received(&slot, 0), 0);
    }

    #[test]
    fn test_sub_frame_completion_bitmap() {
        let d = decoder();
        let mut slot = vec![0u8; d.super_frame_buffer_size()];

        for idx in 0..4 {
            assert!(d.set_sub_frame_complete(&mut slot, idx));
        }
        assert_eq!(d.sub_frames_received(&slot), 4);
        assert!(d.sub_frame_complete(&slot, 3));

        // Repeat and out-of-range are rejected.
        assert!(!d.set_sub_frame_complete(&mut slot, 0));
        assert!(!d.set_sub_frame_complete(&mut slot, 4));
        assert_eq!(d.sub_frames_received(&slot), 4);
    }

    #[test]
    fn test_sub_frame_headers_are_disjoint() {
        let d = decoder();
        let mut slot = vec![0u8; d.super_frame_buffer_size()];
        for idx in 0..4 {
            d.set_sub_frame_number(&mut slot, idx, 100 + idx as u64);
            d.set_sub_frame_start_time(&mut slot, idx, 7000 + idx as u64);
        }
        for idx in 0..4 {
            assert_eq!(d.sub_frame_number(&slot, idx), 100 + idx as u64);
            assert_eq!(d.sub_frame_start_time(&slot, idx), 7000 + idx as u64);
        }
    }
}
