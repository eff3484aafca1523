//! Per-packet header vector.
//!
//! One [`Phv`] is created per ingress frame, owned by exactly one worker for
//! its whole traversal, and destroyed after emit or drop. It carries the
//! packet bytes (front header region plus metadata region), the
//! parsed-header geometry the parser builds up, and the match/dispatch state
//! the gateway, matcher and executor hand between each other.

use bytes::Bytes;
use rmt_chip::geometry::{
    FRONT_HEADER_BYTES, MAX_HEADERS, METADATA_HEADER_ID, PACKET_BUFFER_BYTES,
};
use tracing::debug;

use crate::codec::{self, Data};
use crate::error::{DataplaneError, Result};
use crate::types::{FieldInfo, FieldType, GateEntry, HeaderInfo, MissAction};

/// Parser reset value of the transition key.
pub const TRANS_KEY_RESET: u32 = 0xffff;

/// Per-packet mutable state.
#[derive(Debug, Clone)]
pub struct Phv {
    packet: Vec<u8>,
    frame_len: usize,
    parsed_headers: [HeaderInfo; MAX_HEADERS],
    valid: [bool; MAX_HEADERS],
    bitmap: u32,

    /// Parser state machine: current state id.
    pub cur_state: i32,
    /// Parser cursor into the packet, in bits.
    pub cur_offset: u16,
    /// Number of fields that built the current transition key.
    pub cur_trans_fd_num: u32,
    /// Current transition key.
    pub cur_trans_key: u32,
    /// Whether the last parser level missed.
    pub tcam_miss: bool,
    /// Miss policy recorded by the most recent parser hit.
    pub miss_act: MissAction,

    match_value: Vec<u8>,
    match_value_len: u16,
    /// Whether the most recent matcher lookup hit.
    pub hit: bool,

    /// Discard flag; once set the packet never egresses.
    pub drop: bool,
    /// Processor the packet goes to after the current one.
    pub next_proc_id: i32,
    /// Matcher slot the current processor will apply.
    pub next_matcher_id: i32,
    /// Action the executor will run.
    pub next_action_id: i32,
    /// Gateway verdict for the current processor.
    pub next_op: GateEntry,

    /// Ingress interface id.
    pub ig_if: i32,
    /// Egress interface id.
    pub eg_if: i32,
}

impl Phv {
    /// Copy an ingress frame into a fresh header vector.
    ///
    /// The metadata region (header id 0) is marked parsed and valid from the
    /// start, so metadata fields are addressable before any parsing.
    ///
    /// # Errors
    ///
    /// Returns [`DataplaneError::FrameTooLarge`] when the frame does not fit
    /// the front header region.
    pub fn new(frame: &[u8], ig_if: i32) -> Result<Self> {
        if frame.len() > FRONT_HEADER_BYTES {
            return Err(DataplaneError::FrameTooLarge {
                len: frame.len(),
                capacity: FRONT_HEADER_BYTES,
            });
        }
        let mut packet = vec![0u8; PACKET_BUFFER_BYTES];
        packet[..frame.len()].copy_from_slice(frame);

        let mut phv = Self {
            packet,
            frame_len: frame.len(),
            parsed_headers: [HeaderInfo::default(); MAX_HEADERS],
            valid: [false; MAX_HEADERS],
            bitmap: 0,
            cur_state: 0,
            cur_offset: 0,
            cur_trans_fd_num: 0,
            cur_trans_key: TRANS_KEY_RESET,
            tcam_miss: false,
            miss_act: MissAction::Accept,
            match_value: Vec::new(),
            match_value_len: 0,
            hit: false,
            drop: false,
            next_proc_id: 0,
            next_matcher_id: 0,
            next_action_id: 0,
            next_op: GateEntry::EMIT,
            ig_if,
            eg_if: 0,
        };
        phv.mark_header(
            METADATA_HEADER_ID,
            (FRONT_HEADER_BYTES * 8) as u16,
            (PACKET_BUFFER_BYTES - FRONT_HEADER_BYTES) as u16 * 8,
        );
        Ok(phv)
    }

    /// Record a parsed header and mark it valid.
    pub fn mark_header(&mut self, hdr_id: u8, hdr_offset: u16, hdr_len: u16) {
        let slot = usize::from(hdr_id) % MAX_HEADERS;
        self.parsed_headers[slot] = HeaderInfo {
            hdr_id,
            hdr_offset,
            hdr_len,
        };
        self.valid[slot] = true;
        self.bitmap |= 1 << slot;
    }

    /// Geometry of a parsed header slot.
    #[must_use]
    pub fn parsed_header(&self, hdr_id: u8) -> &HeaderInfo {
        &self.parsed_headers[usize::from(hdr_id) % MAX_HEADERS]
    }

    /// Whether a header has been extracted.
    #[must_use]
    pub fn is_valid(&self, hdr_id: u8) -> bool {
        self.valid[usize::from(hdr_id) % MAX_HEADERS]
    }

    /// Set or clear a header's valid bit.
    pub fn set_valid(&mut self, hdr_id: u8, valid: bool) {
        let slot = usize::from(hdr_id) % MAX_HEADERS;
        self.valid[slot] = valid;
        if valid {
            self.bitmap |= 1 << slot;
        } else {
            self.bitmap &= !(1 << slot);
        }
    }

    /// Packed valid bitmap (bit `i` = header `i` extracted).
    #[must_use]
    pub const fn bitmap(&self) -> u32 {
        self.bitmap
    }

    /// Packet buffer (front header region plus metadata region).
    #[must_use]
    pub fn packet(&self) -> &[u8] {
        &self.packet
    }

    /// Mutable packet buffer.
    pub fn packet_mut(&mut self) -> &mut [u8] {
        &mut self.packet
    }

    /// Ingress frame length in bytes.
    #[must_use]
    pub const fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Value slot published by the most recent matcher hit.
    #[must_use]
    pub fn match_value(&self) -> &[u8] {
        &self.match_value
    }

    /// Bit width of the published value slot.
    #[must_use]
    pub const fn match_value_len(&self) -> u16 {
        self.match_value_len
    }

    /// Publish a matcher value slot.
    pub fn set_match_value(&mut self, bytes: Vec<u8>, len_bits: u16) {
        self.match_value = bytes;
        self.match_value_len = len_bits;
    }

    /// Read one field descriptor.
    ///
    /// `Field` descriptors read the packet buffer through the parsed-header
    /// table; `Valid`, `Hit` and `Miss` read synthetic 1-bit state.
    ///
    /// # Errors
    ///
    /// Returns [`DataplaneError::BufferOverrun`] when a `Field` range
    /// reaches past the packet buffer.
    pub fn read_field(&self, fd: &FieldInfo) -> Result<Data> {
        match fd.fd_type {
            FieldType::Field => {
                let hi = self.parsed_header(fd.hdr_id);
                let start = usize::from(hi.hdr_offset) + usize::from(fd.internal_offset);
                codec::read_bits(&self.packet, start, fd.fd_len)
            }
            FieldType::Valid => Ok(Data::from_u32(1, u32::from(self.is_valid(fd.hdr_id)))),
            FieldType::Hit => Ok(Data::from_u32(1, u32::from(self.hit))),
            FieldType::Miss => Ok(Data::from_u32(1, u32::from(!self.hit))),
        }
    }

    /// Write one field descriptor.
    ///
    /// A `Valid` lvalue writes the low bit of `data` into the header's valid
    /// bit instead of the packet. `Hit`/`Miss` lvalues are not writable and
    /// are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`DataplaneError::BufferOverrun`] when a `Field` range
    /// reaches past the packet buffer.
    pub fn write_field(&mut self, fd: &FieldInfo, data: &Data) -> Result<()> {
        match fd.fd_type {
            FieldType::Field => {
                let hi = self.parsed_header(fd.hdr_id);
                let start = usize::from(hi.hdr_offset) + usize::from(fd.internal_offset);
                codec::write_bits(&mut self.packet, start, fd.fd_len, data)
            }
            FieldType::Valid => {
                self.set_valid(fd.hdr_id, data.bit(0) != 0);
                Ok(())
            }
            FieldType::Hit | FieldType::Miss => {
                debug!("ignoring write to hit/miss pseudo-field");
                Ok(())
            }
        }
    }

    /// Snapshot the egress frame: the ingress frame's byte range with every
    /// in-place rewrite applied.
    #[must_use]
    pub fn egress_frame(&self) -> Bytes {
        Bytes::copy_from_slice(&self.packet[..self.frame_len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_frame_is_rejected() {
        let frame = vec![0u8; FRONT_HEADER_BYTES + 1];
        assert!(matches!(
            Phv::new(&frame, 0),
            Err(DataplaneError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn metadata_region_is_valid_from_the_start() {
        let phv = Phv::new(&[0u8; 64], 0).unwrap();
        assert!(phv.is_valid(METADATA_HEADER_ID));
        let hi = phv.parsed_header(METADATA_HEADER_ID);
        assert_eq!(usize::from(hi.hdr_offset), FRONT_HEADER_BYTES * 8);
    }

    #[test]
    fn metadata_field_round_trips() {
        let mut phv = Phv::new(&[0u8; 64], 0).unwrap();
        let meta_fd = FieldInfo::field(METADATA_HEADER_ID, 13, 11);
        phv.write_field(&meta_fd, &Data::from_u32(11, 0x5A3)).unwrap();
        assert_eq!(phv.read_field(&meta_fd).unwrap().as_u32(), 0x5A3);
        // Metadata writes never leak into the frame bytes.
        assert!(phv.egress_frame().iter().all(|&b| b == 0));
    }

    #[test]
    fn valid_lvalue_writes_the_bitmap() {
        let mut phv = Phv::new(&[0u8; 64], 0).unwrap();
        phv.mark_header(4, 0, 112);
        assert!(phv.is_valid(4));
        phv.write_field(&FieldInfo::valid(4), &Data::from_u32(1, 0)).unwrap();
        assert!(!phv.is_valid(4));
        assert_eq!(phv.bitmap() & (1 << 4), 0);
    }

    #[test]
    fn hit_and_miss_fields_mirror_match_state() {
        let mut phv = Phv::new(&[0u8; 64], 0).unwrap();
        phv.hit = true;
        assert_eq!(phv.read_field(&FieldInfo::hit()).unwrap().as_u32(), 1);
        assert_eq!(phv.read_field(&FieldInfo::miss()).unwrap().as_u32(), 0);
        phv.hit = false;
        assert_eq!(phv.read_field(&FieldInfo::hit()).unwrap().as_u32(), 0);
        assert_eq!(phv.read_field(&FieldInfo::miss()).unwrap().as_u32(), 1);
    }

    #[test]
    fn egress_frame_reflects_in_place_edits() {
        let mut phv = Phv::new(&[0x11, 0x22, 0x33, 0x44], 0).unwrap();
        phv.mark_header(1, 0, 32);
        phv.write_field(&FieldInfo::field(1, 8, 8), &Data::from_u32(8, 0xEE))
            .unwrap();
        assert_eq!(&phv.egress_frame()[..], &[0x11, 0xEE, 0x33, 0x44]);
    }
}
