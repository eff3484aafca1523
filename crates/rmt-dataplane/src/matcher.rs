//! Match engines: key construction, table memories and lookup.
//!
//! Each processor carries sixteen matcher slots. A configured matcher owns
//! one key block — SRAM for exact tables, TCAM for ternary and
//! longest-prefix tables — plus an SRAM value block, claimed from its
//! cluster's pool. The key is the left-to-right concatenation of the
//! configured field slices, right-aligned into the configured key width.
//!
//! A value slot is a 16-bit header (action id in the high 8 bits, low 8
//! reserved) followed by packed action parameters; the matcher publishes
//! the whole slot to the PHV and the executor unpacks parameters from bit
//! 16 onward.

use std::collections::HashMap;

use rmt_chip::mem::{BlockClaim, Sram, Tcam};
use rmt_chip::geometry::{SRAM_WIDTH_BITS, TCAM_WIDTH_BITS};
use tracing::{debug, trace};

use crate::codec;
use crate::error::{DataplaneError, Result};
use crate::phv::Phv;
use crate::types::{FieldInfo, MatchType};

/// Memory descriptor for one matcher.
#[derive(Debug, Clone, Copy)]
pub struct MemConfig {
    /// How the key memory matches.
    pub match_type: MatchType,
    /// Key width in bits.
    pub key_width: u16,
    /// Value slot width in bits (16-bit header plus parameters).
    pub value_width: u16,
    /// Entry capacity.
    pub depth: usize,
    /// Action taken on miss.
    pub miss_act_id: i32,
}

/// One matcher slot.
#[derive(Debug, Default)]
pub struct Matcher {
    match_type: MatchType,
    key_width: u16,
    value_width: u16,
    depth: usize,
    miss_act_id: i32,
    no_table: bool,
    key_fields: Vec<FieldInfo>,
    action_proc: HashMap<i32, i32>,
    key_sram: Option<Sram>,
    key_tcam: Option<Tcam>,
    value_mem: Option<Sram>,
    entries: usize,
    claims: Vec<BlockClaim>,
}

impl Matcher {
    /// Unconfigured slot. Until memory is configured every lookup misses
    /// (or passes through, once `no_table` is set).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether memory has been configured.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.key_sram.is_some() || self.key_tcam.is_some()
    }

    /// Installed entry count.
    #[must_use]
    pub const fn entries(&self) -> usize {
        self.entries
    }

    /// Install a memory configuration over claimed blocks.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the key width does not fit the
    /// block row, the value width cannot hold the 16-bit header, or the
    /// depth exceeds the block.
    pub fn configure(&mut self, cfg: MemConfig, claims: Vec<BlockClaim>) -> Result<()> {
        let (block_width, block_depth) = match cfg.match_type {
            MatchType::Exact => (SRAM_WIDTH_BITS, rmt_chip::geometry::SRAM_DEPTH),
            MatchType::Ternary | MatchType::Lpm => {
                (TCAM_WIDTH_BITS, rmt_chip::geometry::TCAM_DEPTH)
            }
        };
        if cfg.key_width == 0 || cfg.key_width > block_width {
            return Err(DataplaneError::config_invalid(format!(
                "key width {} outside 1..={} for {:?}",
                cfg.key_width, block_width, cfg.match_type
            )));
        }
        if cfg.value_width < 16 || cfg.value_width > SRAM_WIDTH_BITS {
            return Err(DataplaneError::config_invalid(format!(
                "value width {} outside 16..={}",
                cfg.value_width, SRAM_WIDTH_BITS
            )));
        }
        if cfg.depth == 0 || cfg.depth > block_depth {
            return Err(DataplaneError::config_invalid(format!(
                "depth {} outside 1..={block_depth}",
                cfg.depth
            )));
        }

        self.match_type = cfg.match_type;
        self.key_width = cfg.key_width;
        self.value_width = cfg.value_width;
        self.depth = cfg.depth;
        self.miss_act_id = cfg.miss_act_id;
        self.entries = 0;
        match cfg.match_type {
            MatchType::Exact => {
                self.key_sram = Some(Sram::new());
                self.key_tcam = None;
            }
            MatchType::Ternary | MatchType::Lpm => {
                self.key_sram = None;
                self.key_tcam = Some(Tcam::new());
            }
        }
        self.value_mem = Some(Sram::new());
        self.claims = claims;
        Ok(())
    }

    /// Wipe configuration and entries, returning the block claims for the
    /// pool to release.
    pub fn clear_config(&mut self) -> Vec<BlockClaim> {
        let claims = std::mem::take(&mut self.claims);
        *self = Self::default();
        claims
    }

    /// Install the field slices that form the key.
    pub fn set_field_info(&mut self, fields: Vec<FieldInfo>) {
        self.key_fields = fields;
    }

    /// Install the action-to-next-processor map.
    pub fn set_action_proc(&mut self, map: HashMap<i32, i32>) {
        self.action_proc = map;
    }

    /// Set pass-through mode.
    pub fn set_no_table(&mut self, no_table: bool) {
        self.no_table = no_table;
    }

    /// Set the miss action id.
    pub fn set_miss_act_id(&mut self, miss_act_id: i32) {
        self.miss_act_id = miss_act_id;
    }

    /// Install one exact entry at the next free row.
    ///
    /// Key and value byte strings are right-aligned into the configured
    /// widths.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the matcher is not an exact
    /// table, is unconfigured, or is full.
    pub fn insert_sram_entry(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.match_type != MatchType::Exact {
            return Err(DataplaneError::config_invalid(
                "sram entries only install into exact tables",
            ));
        }
        let row = self.next_row()?;
        let key_bytes = usize::from(self.key_width).div_ceil(8);
        let key = codec::Data::from_bytes(u32::from(self.key_width), key);
        let sram = self.key_sram.as_mut().ok_or_else(|| {
            DataplaneError::config_invalid("matcher memory not configured")
        })?;
        sram.row_mut(row)
            .expect("row bounded by depth")[..key_bytes]
            .copy_from_slice(key.as_bytes());
        self.store_value(row, value);
        self.entries += 1;
        Ok(())
    }

    /// Install one ternary/LPM entry at the next free row.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the matcher is not a TCAM-backed
    /// table, is unconfigured, or is full.
    pub fn insert_tcam_entry(&mut self, key: &[u8], mask: &[u8], value: &[u8]) -> Result<()> {
        if self.match_type == MatchType::Exact {
            return Err(DataplaneError::config_invalid(
                "tcam entries only install into ternary/lpm tables",
            ));
        }
        let row = self.next_row()?;
        let key_bytes = usize::from(self.key_width).div_ceil(8);
        let key = codec::Data::from_bytes(u32::from(self.key_width), key);
        let mask = codec::Data::from_bytes(u32::from(self.key_width), mask);
        let tcam = self.key_tcam.as_mut().ok_or_else(|| {
            DataplaneError::config_invalid("matcher memory not configured")
        })?;
        tcam.row_mut(row)
            .expect("row bounded by depth")[..key_bytes]
            .copy_from_slice(key.as_bytes());
        tcam.mask_row_mut(row)
            .expect("row bounded by depth")[..key_bytes]
            .copy_from_slice(mask.as_bytes());
        self.store_value(row, value);
        self.entries += 1;
        Ok(())
    }

    fn next_row(&self) -> Result<usize> {
        if !self.is_configured() {
            return Err(DataplaneError::config_invalid(
                "matcher memory not configured",
            ));
        }
        if self.entries >= self.depth {
            return Err(DataplaneError::config_invalid(format!(
                "table full ({} entries)",
                self.depth
            )));
        }
        Ok(self.entries)
    }

    fn store_value(&mut self, row: usize, value: &[u8]) {
        let value_bytes = usize::from(self.value_width).div_ceil(8);
        let value = codec::Data::from_bytes(u32::from(self.value_width), value);
        if let Some(mem) = self.value_mem.as_mut() {
            mem.row_mut(row).expect("row bounded by depth")[..value_bytes]
                .copy_from_slice(value.as_bytes());
        }
    }

    /// Build the key, search the memory and resolve the result into the
    /// PHV.
    ///
    /// On hit: publish the value slot, set `hit`, the action id (high 8
    /// bits of the slot header) and, when mapped, the next processor. On
    /// miss: clear the slot and fall back to the miss action id. In
    /// `no_table` mode the matcher skips the memory entirely and forwards a
    /// hit with the miss action id.
    pub fn lookup(&self, phv: &mut Phv) {
        if self.no_table {
            phv.hit = true;
            phv.next_action_id = self.miss_act_id;
            phv.set_match_value(Vec::new(), 0);
            self.route(phv, self.miss_act_id);
            return;
        }
        if !self.is_configured() {
            self.resolve_miss(phv);
            return;
        }

        let probe = self.build_key(phv);
        let row = match self.match_type {
            MatchType::Exact => self.search_exact(probe.as_bytes()),
            MatchType::Ternary => self.search_ternary(probe.as_bytes()),
            MatchType::Lpm => self.search_lpm(probe.as_bytes()),
        };
        match row {
            Some(row) => self.resolve_hit(phv, row),
            None => self.resolve_miss(phv),
        }
    }

    fn build_key(&self, phv: &Phv) -> codec::Data {
        let mut values = Vec::with_capacity(self.key_fields.len());
        for fd in &self.key_fields {
            match phv.read_field(fd) {
                Ok(d) => values.push(d),
                Err(e) => {
                    debug!("key field read failed: {e}, substituting zeros");
                    values.push(codec::Data::zero(u32::from(fd.fd_len)));
                }
            }
        }
        codec::concat_bits(&values, self.key_width)
    }

    fn key_bytes(&self) -> usize {
        usize::from(self.key_width).div_ceil(8)
    }

    fn search_exact(&self, probe: &[u8]) -> Option<usize> {
        let sram = self.key_sram.as_ref()?;
        let kb = self.key_bytes();
        (0..self.entries).find(|&row| sram.row(row).is_some_and(|r| &r[..kb] == probe))
    }

    fn search_ternary(&self, probe: &[u8]) -> Option<usize> {
        let tcam = self.key_tcam.as_ref()?;
        let kb = self.key_bytes();
        (0..self.entries).find(|&row| {
            let stored = &tcam.row(row).expect("row bounded by depth")[..kb];
            let mask = &tcam.mask_row(row).expect("row bounded by depth")[..kb];
            stored
                .iter()
                .zip(probe)
                .zip(mask)
                .all(|((s, p), m)| (s ^ p) & m == 0)
        })
    }

    /// Longest-mask-wins: among all matching rows pick the mask with the
    /// most set bits; ties break toward the lowest row index.
    fn search_lpm(&self, probe: &[u8]) -> Option<usize> {
        let tcam = self.key_tcam.as_ref()?;
        let kb = self.key_bytes();
        let mut best: Option<(u32, usize)> = None;
        for row in 0..self.entries {
            let stored = &tcam.row(row).expect("row bounded by depth")[..kb];
            let mask = &tcam.mask_row(row).expect("row bounded by depth")[..kb];
            let matches = stored
                .iter()
                .zip(probe)
                .zip(mask)
                .all(|((s, p), m)| (s ^ p) & m == 0);
            if !matches {
                continue;
            }
            let mask_len: u32 = mask.iter().map(|m| m.count_ones()).sum();
            if best.is_none_or(|(best_len, _)| mask_len > best_len) {
                best = Some((mask_len, row));
            }
        }
        best.map(|(_, row)| row)
    }

    fn resolve_hit(&self, phv: &mut Phv, row: usize) {
        let value_bytes = usize::from(self.value_width).div_ceil(8);
        let slot = self
            .value_mem
            .as_ref()
            .and_then(|m| m.row(row))
            .map(|r| r[..value_bytes].to_vec())
            .unwrap_or_default();
        let action_id = i32::from(slot.first().copied().unwrap_or(0));
        trace!(row, action_id, "matcher hit");
        phv.hit = true;
        phv.next_action_id = action_id;
        phv.set_match_value(slot, self.value_width);
        self.route(phv, action_id);
    }

    fn resolve_miss(&self, phv: &mut Phv) {
        trace!(miss_act_id = self.miss_act_id, "matcher miss");
        phv.hit = false;
        phv.next_action_id = self.miss_act_id;
        phv.set_match_value(Vec::new(), 0);
        self.route(phv, self.miss_act_id);
    }

    fn route(&self, phv: &mut Phv, action_id: i32) {
        if let Some(&next) = self.action_proc.get(&action_id) {
            phv.next_proc_id = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact_mac_matcher() -> Matcher {
        let mut m = Matcher::new();
        m.configure(
            MemConfig {
                match_type: MatchType::Exact,
                key_width: 48,
                value_width: 16,
                depth: 64,
                miss_act_id: 0,
            },
            Vec::new(),
        )
        .unwrap();
        // Key: destination MAC — first 48 bits of the Ethernet header.
        m.set_field_info(vec![FieldInfo::field(1, 0, 48)]);
        m
    }

    fn eth_phv(dst: [u8; 6]) -> Phv {
        let mut frame = vec![0u8; 64];
        frame[..6].copy_from_slice(&dst);
        let mut phv = Phv::new(&frame, 0).unwrap();
        phv.mark_header(1, 0, 112);
        phv
    }

    #[test]
    fn exact_match_resolves_action_and_next_proc() {
        let mut m = exact_mac_matcher();
        m.set_action_proc(HashMap::from([(5, 9)]));
        m.insert_sram_entry(&[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF], &[0x05, 0x00])
            .unwrap();

        let mut phv = eth_phv([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        m.lookup(&mut phv);
        assert!(phv.hit);
        assert_eq!(phv.next_action_id, 5);
        assert_eq!(phv.next_proc_id, 9);
        assert_eq!(phv.match_value(), &[0x05, 0x00]);
        assert_eq!(phv.match_value_len(), 16);
    }

    #[test]
    fn exact_mismatch_takes_the_miss_action() {
        let mut m = exact_mac_matcher();
        m.set_miss_act_id(3);
        m.insert_sram_entry(&[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF], &[0x05, 0x00])
            .unwrap();

        let mut phv = eth_phv([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        m.lookup(&mut phv);
        assert!(!phv.hit);
        assert_eq!(phv.next_action_id, 3);
        assert_eq!(phv.match_value_len(), 0);
    }

    #[test]
    fn ternary_first_match_wins() {
        let mut m = Matcher::new();
        m.configure(
            MemConfig {
                match_type: MatchType::Ternary,
                key_width: 16,
                value_width: 16,
                depth: 16,
                miss_act_id: 0,
            },
            Vec::new(),
        )
        .unwrap();
        m.set_field_info(vec![FieldInfo::field(1, 96, 16)]);
        // Row 0 masks everything out (matches anything); row 1 is exact.
        m.insert_tcam_entry(&[0x00, 0x00], &[0x00, 0x00], &[0x01, 0x00])
            .unwrap();
        m.insert_tcam_entry(&[0x08, 0x00], &[0xFF, 0xFF], &[0x02, 0x00])
            .unwrap();

        let mut frame = vec![0u8; 64];
        frame[12..14].copy_from_slice(&[0x08, 0x00]);
        let mut phv = Phv::new(&frame, 0).unwrap();
        phv.mark_header(1, 0, 112);
        m.lookup(&mut phv);
        assert!(phv.hit);
        assert_eq!(phv.next_action_id, 1, "insertion order breaks the tie");
    }

    #[test]
    fn lpm_prefers_longest_mask_regardless_of_order() {
        let mut m = Matcher::new();
        m.configure(
            MemConfig {
                match_type: MatchType::Lpm,
                key_width: 32,
                value_width: 16,
                depth: 16,
                miss_act_id: 0,
            },
            Vec::new(),
        )
        .unwrap();
        m.set_field_info(vec![FieldInfo::field(2, 128, 32)]);
        // /8 installed before /24: the /24 must still win.
        m.insert_tcam_entry(&[10, 0, 0, 0], &[0xFF, 0, 0, 0], &[0x01, 0x00])
            .unwrap();
        m.insert_tcam_entry(&[10, 1, 2, 0], &[0xFF, 0xFF, 0xFF, 0], &[0x02, 0x00])
            .unwrap();

        let mut frame = vec![0u8; 64];
        frame[30..34].copy_from_slice(&[10, 1, 2, 77]); // IPv4 dst addr
        let mut phv = Phv::new(&frame, 0).unwrap();
        phv.mark_header(2, 112, 160);
        m.lookup(&mut phv);
        assert!(phv.hit);
        assert_eq!(phv.next_action_id, 2);

        // Outside the /24, the /8 still matches.
        let mut frame = vec![0u8; 64];
        frame[30..34].copy_from_slice(&[10, 9, 9, 9]);
        let mut phv = Phv::new(&frame, 0).unwrap();
        phv.mark_header(2, 112, 160);
        m.lookup(&mut phv);
        assert_eq!(phv.next_action_id, 1);
    }

    #[test]
    fn key_concatenates_multiple_fields() {
        let mut m = Matcher::new();
        m.configure(
            MemConfig {
                match_type: MatchType::Exact,
                key_width: 24,
                value_width: 16,
                depth: 4,
                miss_act_id: 0,
            },
            Vec::new(),
        )
        .unwrap();
        m.set_field_info(vec![
            FieldInfo::field(1, 96, 16), // ethertype
            FieldInfo::field(1, 0, 8),   // first MAC byte
        ]);
        m.insert_sram_entry(&[0x08, 0x00, 0xAA], &[0x01, 0x00]).unwrap();

        let mut frame = vec![0u8; 64];
        frame[0] = 0xAA;
        frame[12..14].copy_from_slice(&[0x08, 0x00]);
        let mut phv = Phv::new(&frame, 0).unwrap();
        phv.mark_header(1, 0, 112);
        m.lookup(&mut phv);
        assert!(phv.hit);
    }

    #[test]
    fn no_table_forwards_a_hit_with_the_miss_action() {
        let mut m = Matcher::new();
        m.set_no_table(true);
        m.set_miss_act_id(4);
        m.set_action_proc(HashMap::from([(4, 2)]));
        let mut phv = eth_phv([0; 6]);
        m.lookup(&mut phv);
        assert!(phv.hit);
        assert_eq!(phv.next_action_id, 4);
        assert_eq!(phv.next_proc_id, 2);
    }

    #[test]
    fn unconfigured_matcher_misses() {
        let m = Matcher::new();
        let mut phv = eth_phv([0; 6]);
        m.lookup(&mut phv);
        assert!(!phv.hit);
    }

    #[test]
    fn inserts_past_depth_are_rejected() {
        let mut m = Matcher::new();
        m.configure(
            MemConfig {
                match_type: MatchType::Exact,
                key_width: 8,
                value_width: 16,
                depth: 2,
                miss_act_id: 0,
            },
            Vec::new(),
        )
        .unwrap();
        m.insert_sram_entry(&[1], &[0x01, 0x00]).unwrap();
        m.insert_sram_entry(&[2], &[0x02, 0x00]).unwrap();
        assert!(m.insert_sram_entry(&[3], &[0x03, 0x00]).is_err());
    }

    #[test]
    fn wrong_entry_kind_is_rejected() {
        let mut m = exact_mac_matcher();
        assert!(m.insert_tcam_entry(&[0; 6], &[0; 6], &[0; 2]).is_err());
    }

    #[test]
    fn key_width_must_fit_the_block() {
        let mut m = Matcher::new();
        let bad = MemConfig {
            match_type: MatchType::Ternary,
            key_width: 65, // TCAM rows are 64 bits
            value_width: 16,
            depth: 4,
            miss_act_id: 0,
        };
        assert!(m.configure(bad, Vec::new()).is_err());
    }
}
