//! Configuration vocabulary shared across the pipeline.
//!
//! These are the small descriptor types the control plane installs and the
//! per-packet machinery reads: where a header sits, where a field sits
//! inside its header, how a table matches, and where a gateway verdict
//! sends the packet next. All offsets and lengths are in **bits** unless a
//! name says otherwise.

/// Where a parsed header starts inside the packet buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderInfo {
    /// Header id (0 is the metadata region).
    pub hdr_id: u8,
    /// Offset of the header from the start of the packet buffer, in bits.
    pub hdr_offset: u16,
    /// Header length in bits.
    pub hdr_len: u16,
}

/// What a field descriptor actually reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FieldType {
    /// A bit range inside the packet buffer.
    #[default]
    Field,
    /// The 1-bit header-valid flag for `hdr_id`.
    Valid,
    /// The 1-bit most-recent-match hit flag.
    Hit,
    /// The complement of [`FieldType::Hit`].
    Miss,
}

/// One field, located relative to its header.
///
/// `Valid`, `Hit` and `Miss` descriptors do not index into the packet; they
/// read synthetic 1-bit per-packet state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FieldInfo {
    /// Header the field belongs to.
    pub hdr_id: u8,
    /// Offset from the start of the header, in bits.
    pub internal_offset: u16,
    /// Field length in bits.
    pub fd_len: u16,
    /// What the descriptor reads.
    pub fd_type: FieldType,
}

impl FieldInfo {
    /// A packet field.
    #[must_use]
    pub const fn field(hdr_id: u8, internal_offset: u16, fd_len: u16) -> Self {
        Self {
            hdr_id,
            internal_offset,
            fd_len,
            fd_type: FieldType::Field,
        }
    }

    /// The valid bit of a header.
    #[must_use]
    pub const fn valid(hdr_id: u8) -> Self {
        Self {
            hdr_id,
            internal_offset: 0,
            fd_len: 1,
            fd_type: FieldType::Valid,
        }
    }

    /// The most-recent-match hit bit.
    #[must_use]
    pub const fn hit() -> Self {
        Self {
            hdr_id: 0,
            internal_offset: 0,
            fd_len: 1,
            fd_type: FieldType::Hit,
        }
    }

    /// The most-recent-match miss bit.
    #[must_use]
    pub const fn miss() -> Self {
        Self {
            hdr_id: 0,
            internal_offset: 0,
            fd_len: 1,
            fd_type: FieldType::Miss,
        }
    }
}

/// How a matcher's key memory matches a probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MatchType {
    /// Byte-for-byte equality against SRAM rows.
    #[default]
    Exact,
    /// Masked equality against TCAM rows, first hit wins.
    Ternary,
    /// Masked equality against TCAM rows, longest mask wins.
    Lpm,
}

/// What the parser does with a packet when no entry matches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MissAction {
    /// Hand the packet to the first processor anyway.
    #[default]
    Accept,
    /// Discard the packet.
    Drop,
}

/// Where a gateway verdict routes the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateEntryType {
    /// A matcher slot in the same processor.
    Table,
    /// Another processor.
    Stage,
}

/// A gateway verdict: a target kind plus its id.
///
/// A `Stage` value that is negative or at/beyond the addressable processor
/// range is the emit sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateEntry {
    /// Target kind.
    pub entry_type: GateEntryType,
    /// Matcher slot or processor id.
    pub val: i32,
}

impl GateEntry {
    /// Route to a matcher slot in the current processor.
    #[must_use]
    pub const fn table(matcher_id: i32) -> Self {
        Self {
            entry_type: GateEntryType::Table,
            val: matcher_id,
        }
    }

    /// Route to another processor.
    #[must_use]
    pub const fn stage(proc_id: i32) -> Self {
        Self {
            entry_type: GateEntryType::Stage,
            val: proc_id,
        }
    }

    /// The emit sentinel: leave the pipeline after this processor.
    pub const EMIT: Self = Self::stage(-1);
}

impl Default for GateEntry {
    fn default() -> Self {
        Self::EMIT
    }
}

/// Relations a gateway expression can test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationCode {
    /// Equal.
    Eq,
    /// Not equal.
    Neq,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Gte,
    /// Less than.
    Lt,
    /// Less than or equal.
    Lte,
}
