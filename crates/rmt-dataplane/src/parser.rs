//! TCAM-style programmable parser.
//!
//! A parser is a fixed number of levels. Each level holds entries keyed on
//! `(current_state, transition_key)` with a per-entry mask; the first entry
//! whose masked key equals the masked transition key wins. A hit extracts
//! one header, advances the bit cursor, rebuilds the 32-bit transition key
//! from the entry's transition fields and moves to the entry's next state.
//! A miss stops parsing; the packet is then accepted into the pipeline or
//! dropped according to the miss policy recorded by the most recent hit.

use rmt_chip::geometry::{FRONT_HEADER_BYTES, TRANS_KEY_BITS};
use tracing::{debug, error, trace};

use crate::codec;
use crate::error::{DataplaneError, Result};
use crate::phv::Phv;
use crate::types::{FieldInfo, MissAction};

/// One parser entry: TCAM half (state/key/mask) plus the co-indexed SRAM
/// half (extraction, transition and miss policy).
#[derive(Debug, Clone)]
pub struct ParserEntry {
    /// State this entry applies in.
    pub state: i32,
    /// Transition-key value to match.
    pub key: u32,
    /// Ternary mask over `key`.
    pub mask: u32,
    /// Header to extract on hit (ids start at 1; 0 is metadata).
    pub hdr_id: u8,
    /// Extracted header length in bits.
    pub hdr_len: u16,
    /// State after this entry.
    pub next_state: i32,
    /// Fields whose concatenation forms the next transition key. Owned
    /// copies: installation deep-copies the descriptors.
    pub trans_fields: Vec<FieldInfo>,
    /// What to do with the packet when a later level misses.
    pub miss_act: MissAction,
}

impl ParserEntry {
    fn matches(&self, state: i32, trans_key: u32) -> bool {
        self.state == state && (self.key & self.mask) == (trans_key & self.mask)
    }
}

/// One processor's parser.
#[derive(Debug, Clone, Default)]
pub struct Parser {
    levels: Vec<Vec<ParserEntry>>,
}

impl Parser {
    /// Parser with no levels (accepts everything unparsed).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fix the number of levels, discarding any existing entries.
    pub fn init_levels(&mut self, n: usize) {
        self.levels = vec![Vec::new(); n];
    }

    /// Number of levels.
    #[must_use]
    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Install or update one entry.
    ///
    /// An entry with the same `(state, key, mask)` triple in the level is
    /// replaced in place; otherwise the entry is appended, and lookups scan
    /// in insertion order.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the level is out of range or the
    /// entry extracts into the metadata header id.
    pub fn modify_entry(&mut self, level: usize, entry: ParserEntry) -> Result<()> {
        if entry.hdr_id == 0 {
            return Err(DataplaneError::config_invalid(
                "parser entries cannot extract header id 0 (metadata)",
            ));
        }
        let count = self.levels.len();
        let Some(slot) = self.levels.get_mut(level) else {
            return Err(DataplaneError::config_invalid(format!(
                "parser level {level} out of range (have {count})"
            )));
        };
        if let Some(existing) = slot
            .iter_mut()
            .find(|e| e.state == entry.state && e.key == entry.key && e.mask == entry.mask)
        {
            *existing = entry;
        } else {
            slot.push(entry);
        }
        Ok(())
    }

    /// Discard all levels and entries.
    pub fn clear(&mut self) {
        self.levels.clear();
    }

    /// Walk the packet through every level.
    ///
    /// Mutates the PHV only: parsed-header table, valid bits, parser state
    /// and, on a fatal extraction or a drop-policy miss, the drop flag.
    pub fn parse(&self, phv: &mut Phv) {
        phv.tcam_miss = false;
        for (level_idx, level) in self.levels.iter().enumerate() {
            let Some(entry) = level
                .iter()
                .find(|e| e.matches(phv.cur_state, phv.cur_trans_key))
            else {
                phv.tcam_miss = true;
                if phv.miss_act == MissAction::Drop {
                    debug!(level = level_idx, "parser miss, dropping per policy");
                    phv.drop = true;
                } else {
                    debug!(level = level_idx, "parser miss, accepting");
                }
                return;
            };

            let end_bit = usize::from(phv.cur_offset) + usize::from(entry.hdr_len);
            if end_bit > FRONT_HEADER_BYTES * 8 {
                error!(
                    hdr_id = entry.hdr_id,
                    end_bit, "header extraction past packet buffer, dropping"
                );
                phv.drop = true;
                return;
            }

            phv.miss_act = entry.miss_act;
            phv.mark_header(entry.hdr_id, phv.cur_offset, entry.hdr_len);
            phv.cur_offset += entry.hdr_len;
            phv.cur_state = entry.next_state;

            match self.build_trans_key(phv, &entry.trans_fields) {
                Ok(key) => {
                    phv.cur_trans_key = key;
                    phv.cur_trans_fd_num = entry.trans_fields.len() as u32;
                }
                Err(e) => {
                    error!("transition-field read failed: {e}, dropping");
                    phv.drop = true;
                    return;
                }
            }
            trace!(
                level = level_idx,
                hdr_id = entry.hdr_id,
                state = phv.cur_state,
                key = phv.cur_trans_key,
                "parser hit"
            );
        }
    }

    fn build_trans_key(&self, phv: &Phv, fields: &[FieldInfo]) -> Result<u32> {
        if fields.is_empty() {
            return Ok(0);
        }
        let mut values = Vec::with_capacity(fields.len());
        for fd in fields {
            values.push(phv.read_field(fd)?);
        }
        Ok(codec::concat_bits(&values, TRANS_KEY_BITS).as_u32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(state: i32, key: u32, mask: u32) -> ParserEntry {
        ParserEntry {
            state,
            key,
            mask,
            hdr_id: 1,
            hdr_len: 112,
            next_state: 1,
            trans_fields: Vec::new(),
            miss_act: MissAction::Accept,
        }
    }

    /// 14-byte Ethernet frame with the given ethertype, plus payload.
    fn eth_frame(ethertype: u16, payload_len: usize) -> Vec<u8> {
        let mut f = vec![0u8; 14 + payload_len];
        f[12..14].copy_from_slice(&ethertype.to_be_bytes());
        f
    }

    #[test]
    fn identity_parser_extracts_ethernet() {
        let mut p = Parser::new();
        p.init_levels(1);
        p.modify_entry(0, entry(0, 0, 0)).unwrap();

        let frame = eth_frame(0x0800, 46);
        let mut phv = Phv::new(&frame, 0).unwrap();
        p.parse(&mut phv);

        assert!(!phv.drop);
        assert!(phv.is_valid(1));
        let hi = phv.parsed_header(1);
        assert_eq!(hi.hdr_offset, 0);
        assert_eq!(hi.hdr_len, 112);
        assert_eq!(phv.cur_offset, 112);
        assert_eq!(phv.cur_state, 1);
    }

    #[test]
    fn transition_key_selects_next_level() {
        let mut p = Parser::new();
        p.init_levels(2);
        // Level 0: extract Ethernet, key on the ethertype.
        let mut eth = entry(0, 0, 0);
        eth.trans_fields = vec![FieldInfo::field(1, 96, 16)];
        p.modify_entry(0, eth).unwrap();
        // Level 1: IPv4 only.
        let mut ip = entry(1, 0x0800, 0xFFFF);
        ip.hdr_id = 2;
        ip.hdr_len = 160;
        ip.next_state = 2;
        p.modify_entry(1, ip).unwrap();

        let mut phv = Phv::new(&eth_frame(0x0800, 46), 0).unwrap();
        p.parse(&mut phv);
        assert!(phv.is_valid(2));
        assert_eq!(phv.parsed_header(2).hdr_offset, 112);
        assert_eq!(phv.cur_offset, 112 + 160);
        assert_eq!(phv.cur_trans_key, 0);

        // Non-IPv4 misses level 1 but is accepted.
        let mut phv = Phv::new(&eth_frame(0x86DD, 46), 0).unwrap();
        p.parse(&mut phv);
        assert!(!phv.is_valid(2));
        assert!(phv.tcam_miss);
        assert!(!phv.drop);
    }

    #[test]
    fn miss_policy_from_last_hit_drops() {
        let mut p = Parser::new();
        p.init_levels(2);
        let mut eth = entry(0, 0, 0);
        eth.miss_act = MissAction::Drop;
        eth.trans_fields = vec![FieldInfo::field(1, 96, 16)];
        p.modify_entry(0, eth).unwrap();
        let mut ip = entry(1, 0x0800, 0xFFFF);
        ip.hdr_id = 2;
        ip.hdr_len = 160;
        p.modify_entry(1, ip).unwrap();

        let mut phv = Phv::new(&eth_frame(0x86DD, 46), 0).unwrap();
        p.parse(&mut phv);
        assert!(phv.drop);
    }

    #[test]
    fn parsing_is_deterministic() {
        let mut p = Parser::new();
        p.init_levels(2);
        let mut eth = entry(0, 0, 0);
        eth.trans_fields = vec![FieldInfo::field(1, 96, 16)];
        p.modify_entry(0, eth).unwrap();
        let mut ip = entry(1, 0x0800, 0xFFFF);
        ip.hdr_id = 2;
        ip.hdr_len = 160;
        p.modify_entry(1, ip).unwrap();

        let frame = eth_frame(0x0800, 60);
        let mut a = Phv::new(&frame, 3).unwrap();
        let mut b = Phv::new(&frame, 3).unwrap();
        p.parse(&mut a);
        p.parse(&mut b);
        assert_eq!(a.cur_state, b.cur_state);
        assert_eq!(a.cur_offset, b.cur_offset);
        assert_eq!(a.drop, b.drop);
        assert_eq!(a.bitmap(), b.bitmap());
        for id in 0..4u8 {
            assert_eq!(a.parsed_header(id), b.parsed_header(id));
        }
    }

    #[test]
    fn reinstalling_an_entry_updates_in_place() {
        let mut p = Parser::new();
        p.init_levels(1);
        p.modify_entry(0, entry(0, 0, 0)).unwrap();
        let mut updated = entry(0, 0, 0);
        updated.hdr_len = 48;
        p.modify_entry(0, updated).unwrap();

        let mut phv = Phv::new(&eth_frame(0x0800, 46), 0).unwrap();
        p.parse(&mut phv);
        assert_eq!(phv.parsed_header(1).hdr_len, 48);
    }

    #[test]
    fn oversized_extraction_drops_the_packet() {
        let mut p = Parser::new();
        p.init_levels(1);
        let mut e = entry(0, 0, 0);
        e.hdr_len = u16::MAX; // 65535 bits, past the front region
        p.modify_entry(0, e).unwrap();
        let mut phv = Phv::new(&eth_frame(0x0800, 46), 0).unwrap();
        p.parse(&mut phv);
        assert!(phv.drop);
    }

    #[test]
    fn entry_for_metadata_header_is_rejected() {
        let mut p = Parser::new();
        p.init_levels(1);
        let mut e = entry(0, 0, 0);
        e.hdr_id = 0;
        assert!(p.modify_entry(0, e).is_err());
    }

    #[test]
    fn entry_outside_levels_is_rejected() {
        let mut p = Parser::new();
        p.init_levels(1);
        assert!(p.modify_entry(3, entry(0, 0, 0)).is_err());
    }
}
