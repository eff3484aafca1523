//! Gateway: the predicate block in front of a processor's tables.
//!
//! A gateway evaluates an ordered list of relational expressions over
//! fields and constants, packs the truth values into a bitmap, and maps the
//! bitmap to a verdict: apply a matcher slot in this processor, or jump to
//! another processor. An unmapped bitmap falls back to the configurable
//! default verdict.

use std::collections::HashMap;

use tracing::trace;

use crate::codec::Data;
use crate::phv::Phv;
use crate::types::{FieldInfo, GateEntry, RelationCode};

/// One side of a relational expression.
#[derive(Debug, Clone)]
pub enum GateParam {
    /// A field read.
    Field(FieldInfo),
    /// A literal.
    Constant(Data),
}

impl GateParam {
    fn value(&self, phv: &Phv) -> u32 {
        match self {
            Self::Field(fd) => phv.read_field(fd).map_or(0, |d| d.as_u32()),
            Self::Constant(d) => d.as_u32(),
        }
    }
}

/// One relational expression, `param1 relation param2`.
#[derive(Debug, Clone)]
pub struct RelationExp {
    /// Left operand.
    pub param1: GateParam,
    /// Right operand.
    pub param2: GateParam,
    /// Relation between the operands.
    pub relation: RelationCode,
}

impl RelationExp {
    fn holds(&self, phv: &Phv) -> bool {
        let a = self.param1.value(phv);
        let b = self.param2.value(phv);
        match self.relation {
            RelationCode::Eq => a == b,
            RelationCode::Neq => a != b,
            RelationCode::Gt => a > b,
            RelationCode::Gte => a >= b,
            RelationCode::Lt => a < b,
            RelationCode::Lte => a <= b,
        }
    }
}

/// One processor's gateway.
#[derive(Debug, Clone, Default)]
pub struct Gateway {
    exps: Vec<RelationExp>,
    res_map: HashMap<u32, GateEntry>,
    default_entry: GateEntry,
}

impl Gateway {
    /// Gateway with no expressions; every packet takes the default verdict.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one expression. Its truth value becomes the next bitmap bit.
    pub fn insert_exp(&mut self, exp: RelationExp) {
        self.exps.push(exp);
    }

    /// Discard all expressions.
    pub fn clear_exps(&mut self) {
        self.exps.clear();
    }

    /// Map a bitmap to a verdict.
    pub fn mod_res_map(&mut self, bitmap: u32, entry: GateEntry) {
        self.res_map.insert(bitmap, entry);
    }

    /// Discard the bitmap map.
    pub fn clear_res_map(&mut self) {
        self.res_map.clear();
    }

    /// Set the verdict for unmapped bitmaps.
    pub fn set_default_entry(&mut self, entry: GateEntry) {
        self.default_entry = entry;
    }

    /// Evaluate every expression and translate the bitmap to a verdict.
    #[must_use]
    pub fn evaluate(&self, phv: &Phv) -> GateEntry {
        let mut bitmap = 0u32;
        for (i, exp) in self.exps.iter().enumerate() {
            if exp.holds(phv) {
                bitmap |= 1 << i;
            }
        }
        let entry = self
            .res_map
            .get(&bitmap)
            .copied()
            .unwrap_or(self.default_entry);
        trace!(bitmap, ?entry, "gateway verdict");
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldType;

    /// Ethernet + IPv4 skeleton with the given TTL, headers pre-marked.
    fn ipv4_phv(ttl: u8, ipv4_valid: bool) -> Phv {
        let mut frame = vec![0u8; 64];
        frame[22] = ttl; // TTL at byte 8 of the IPv4 header
        let mut phv = Phv::new(&frame, 0).unwrap();
        phv.mark_header(1, 0, 112);
        if ipv4_valid {
            phv.mark_header(2, 112, 160);
        }
        phv
    }

    fn branching_gateway() -> Gateway {
        let mut g = Gateway::new();
        // expr 0: ipv4.valid == 1
        g.insert_exp(RelationExp {
            param1: GateParam::Field(FieldInfo {
                hdr_id: 2,
                internal_offset: 0,
                fd_len: 1,
                fd_type: FieldType::Valid,
            }),
            param2: GateParam::Constant(Data::from_u32(1, 1)),
            relation: RelationCode::Eq,
        });
        // expr 1: ipv4.ttl < 2
        g.insert_exp(RelationExp {
            param1: GateParam::Field(FieldInfo::field(2, 64, 8)),
            param2: GateParam::Constant(Data::from_u32(8, 2)),
            relation: RelationCode::Lt,
        });
        g.mod_res_map(0b11, GateEntry::stage(5));
        g.mod_res_map(0b01, GateEntry::table(2));
        g.set_default_entry(GateEntry::EMIT);
        g
    }

    #[test]
    fn bitmap_selects_mapped_entries() {
        let g = branching_gateway();
        // Valid IPv4, ttl 64: only expr 0 holds.
        assert_eq!(g.evaluate(&ipv4_phv(64, true)), GateEntry::table(2));
        // Valid IPv4, ttl 1: both hold.
        assert_eq!(g.evaluate(&ipv4_phv(1, true)), GateEntry::stage(5));
        // Non-IPv4: neither holds, bitmap 0 unmapped, default applies.
        assert_eq!(g.evaluate(&ipv4_phv(64, false)), GateEntry::EMIT);
    }

    #[test]
    fn all_relations_compare_unsigned() {
        let mk = |rel| RelationExp {
            param1: GateParam::Constant(Data::from_u32(8, 200)),
            param2: GateParam::Constant(Data::from_u32(8, 100)),
            relation: rel,
        };
        let phv = Phv::new(&[0u8; 16], 0).unwrap();
        assert!(!mk(RelationCode::Eq).holds(&phv));
        assert!(mk(RelationCode::Neq).holds(&phv));
        assert!(mk(RelationCode::Gt).holds(&phv));
        assert!(mk(RelationCode::Gte).holds(&phv));
        assert!(!mk(RelationCode::Lt).holds(&phv));
        assert!(!mk(RelationCode::Lte).holds(&phv));
    }

    #[test]
    fn cleared_gateway_falls_back_to_default() {
        let mut g = branching_gateway();
        g.clear_exps();
        g.clear_res_map();
        g.set_default_entry(GateEntry::table(7));
        assert_eq!(g.evaluate(&ipv4_phv(64, true)), GateEntry::table(7));
    }
}
