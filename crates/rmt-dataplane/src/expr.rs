//! Expression-tree evaluator.
//!
//! Action right-hand sides are operator trees over constants, packet fields
//! and action parameters. Trees live in a per-action arena ([`ExpArena`])
//! and nodes reference children by index, so dropping an action frees its
//! whole tree at once and evaluation never chases heap pointers.
//!
//! Runtime failures (divide by zero, missing accelerator state, width
//! violations) never abort the packet: the evaluator logs once and yields a
//! zero value of the destination width, so one malformed primitive cannot
//! take the data plane down.

use tracing::{error, warn};

use crate::accel::{
    self, NeuronRegistry, SigmoidTable, FIXED_POINT_BITS,
};
use crate::codec::{self, Data};
use crate::phv::Phv;
use crate::types::FieldInfo;

/// Operators an expression node can apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// Unsigned 32-bit addition.
    Add,
    /// Unsigned 32-bit subtraction.
    Sub,
    /// 64-bit multiply truncated to the low 32 bits.
    Mul,
    /// Unsigned integer division; divide-by-zero yields zero.
    Div,
    /// Left shift, masked to the left operand's width.
    ShiftLeft,
    /// Logical right shift at the left operand's width.
    ShiftRight,
    /// Bitwise and at the left operand's width.
    BitAnd,
    /// Bitwise or at the left operand's width.
    BitOr,
    /// Bitwise xor at the left operand's width.
    BitXor,
    /// Unary complement, masked to the operand's width.
    BitNeg,
    /// MAC + activation over a pre-loaded context.
    NeuronPrimitive,
    /// Preloaded sigmoid table lookup.
    SigmoidLookup,
    /// Positional chunk sum across equally wide blocks.
    SumBlock,
}

/// Index of a node inside an [`ExpArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpId(u32);

/// One expression-tree node.
#[derive(Debug, Clone)]
pub enum ExpNode {
    /// A literal value.
    Constant(Data),
    /// A field read from the packet or per-packet state.
    Field(FieldInfo),
    /// An action parameter by index.
    Param(u8),
    /// An operator over one or two children.
    Op {
        /// Operator to apply.
        op: OpCode,
        /// Left (or only) operand.
        left: ExpId,
        /// Right operand; `None` for unary operators.
        right: Option<ExpId>,
    },
}

/// Arena owning every node of one action's expression trees.
#[derive(Debug, Clone, Default)]
pub struct ExpArena {
    nodes: Vec<ExpNode>,
}

impl ExpArena {
    /// Empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node, returning its id.
    pub fn push(&mut self, node: ExpNode) -> ExpId {
        let id = ExpId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    /// Borrow a node.
    #[must_use]
    pub fn node(&self, id: ExpId) -> &ExpNode {
        &self.nodes[id.0 as usize]
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the arena holds no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Everything an evaluation reads: the packet, the unpacked action
/// parameters, the accelerator registries, and the destination width used
/// to size zero results on failure.
pub struct EvalEnv<'a> {
    /// Packet under execution.
    pub phv: &'a Phv,
    /// Unpacked action parameters.
    pub params: &'a [Data],
    /// Neuron context registry.
    pub neurons: &'a NeuronRegistry,
    /// Sigmoid lookup table.
    pub sigmoid: &'a SigmoidTable,
    /// Width of the primitive's lvalue, or 0 when there is none.
    pub lvalue_bits: u32,
}

impl EvalEnv<'_> {
    fn zero(&self) -> Data {
        Data::zero(if self.lvalue_bits == 0 {
            32
        } else {
            self.lvalue_bits
        })
    }
}

/// Evaluate the tree rooted at `id`.
#[must_use]
pub fn evaluate(env: &EvalEnv<'_>, arena: &ExpArena, id: ExpId) -> Data {
    match arena.node(id) {
        ExpNode::Constant(d) => d.clone(),
        ExpNode::Field(fd) => match env.phv.read_field(fd) {
            Ok(d) => d,
            Err(e) => {
                error!("field read failed during evaluation: {e}");
                Data::zero(u32::from(fd.fd_len))
            }
        },
        ExpNode::Param(idx) => match env.params.get(usize::from(*idx)) {
            Some(d) => d.clone(),
            None => {
                error!(
                    "action parameter {idx} out of range (have {})",
                    env.params.len()
                );
                env.zero()
            }
        },
        ExpNode::Op { op, left, right } => apply_op(env, arena, *op, *left, *right),
    }
}

fn apply_op(
    env: &EvalEnv<'_>,
    arena: &ExpArena,
    op: OpCode,
    left: ExpId,
    right: Option<ExpId>,
) -> Data {
    // Binary operators need a right child; BIT_NEG is the unary exception
    // and SIGMOID_LOOKUP's second operand is optional.
    let binary = |env: &EvalEnv<'_>| -> Option<(Data, Data)> {
        let Some(rid) = right else {
            error!("operator {op:?} is missing its right operand");
            return None;
        };
        Some((evaluate(env, arena, left), evaluate(env, arena, rid)))
    };

    match op {
        OpCode::Add => match binary(env) {
            Some((l, r)) => Data::from_u32(32, l.as_u32().wrapping_add(r.as_u32())),
            None => env.zero(),
        },
        OpCode::Sub => match binary(env) {
            Some((l, r)) => Data::from_u32(32, l.as_u32().wrapping_sub(r.as_u32())),
            None => env.zero(),
        },
        OpCode::Mul => match binary(env) {
            Some((l, r)) => {
                let wide = u64::from(l.as_u32()) * u64::from(r.as_u32());
                Data::from_u32(32, wide as u32)
            }
            None => env.zero(),
        },
        OpCode::Div => match binary(env) {
            Some((l, r)) => {
                let divisor = r.as_u32();
                if divisor == 0 {
                    warn!("division by zero, yielding 0");
                    Data::from_u32(32, 0)
                } else {
                    Data::from_u32(32, l.as_u32() / divisor)
                }
            }
            None => env.zero(),
        },
        OpCode::ShiftLeft => match binary(env) {
            Some((l, r)) => {
                let bits = l.bits();
                let shift = r.as_u32();
                let value = if shift >= 64 {
                    0
                } else {
                    (u64::from(l.as_u32()) << shift) & codec::mask_u64(bits.min(32))
                };
                Data::from_u32(bits, value as u32)
            }
            None => env.zero(),
        },
        OpCode::ShiftRight => match binary(env) {
            Some((l, r)) => {
                let shift = r.as_u32();
                let value = if shift >= 32 { 0 } else { l.as_u32() >> shift };
                Data::from_u32(l.bits(), value)
            }
            None => env.zero(),
        },
        OpCode::BitAnd => match binary(env) {
            Some((l, r)) => Data::from_u32(l.bits(), l.as_u32() & r.as_u32()),
            None => env.zero(),
        },
        OpCode::BitOr => match binary(env) {
            Some((l, r)) => Data::from_u32(l.bits(), l.as_u32() | r.as_u32()),
            None => env.zero(),
        },
        OpCode::BitXor => match binary(env) {
            Some((l, r)) => Data::from_u32(l.bits(), l.as_u32() ^ r.as_u32()),
            None => env.zero(),
        },
        OpCode::BitNeg => {
            let l = evaluate(env, arena, left);
            let value = !l.as_u32() & codec::mask_u64(l.bits().min(32)) as u32;
            Data::from_u32(l.bits(), value)
        }
        OpCode::SigmoidLookup => {
            let input = evaluate(env, arena, left);
            let out_bits = right.map_or(0, |rid| evaluate(env, arena, rid).as_u32());
            match env.sigmoid.snapshot() {
                Some(table) => accel::sigmoid_lookup(&table, &input, out_bits),
                None => {
                    error!("sigmoid lookup with no table loaded");
                    Data::zero(if out_bits == 0 { 32 } else { out_bits.min(32) })
                }
            }
        }
        OpCode::NeuronPrimitive => {
            let Some(rid) = right else {
                error!("neuron primitive expects feature and context operands");
                return env.zero();
            };
            let features = evaluate(env, arena, left);
            let context_id = evaluate(env, arena, rid).as_u32() as u16;
            let Some(ctx) = env.neurons.get(context_id) else {
                warn!("neuron primitive context {context_id} not found");
                return env.zero();
            };
            let expected_bits = ctx.num_neurons * FIXED_POINT_BITS;
            if env.lvalue_bits != 0 && expected_bits != env.lvalue_bits {
                warn!(
                    "neuron primitive output width ({expected_bits}) mismatches field width {}",
                    env.lvalue_bits
                );
            }
            let sigmoid = env.sigmoid.snapshot();
            match accel::run_neuron_primitive(&ctx, &features, sigmoid.as_deref()) {
                Ok(out) => out,
                Err(e) => {
                    error!("neuron primitive failed: {e}");
                    Data::zero(expected_bits)
                }
            }
        }
        OpCode::SumBlock => sum_block(env, arena, left, right),
    }
}

/// Evaluate a right-associative `SUM_BLOCK` chain.
///
/// `sum_block(b1, sum_block(b2, … sum_block(bk, N)…))`: every block must
/// have the same width `W`, divisible by the neuron count `N` at the chain's
/// rightmost leaf. Blocks split into `N` chunks of `W / N` bits, sum
/// positionally, saturate per chunk, and repack.
fn sum_block(env: &EvalEnv<'_>, arena: &ExpArena, left: ExpId, right: Option<ExpId>) -> Data {
    let fail = |reason: &str| -> Data {
        error!("sum_block: {reason}");
        env.zero()
    };

    let mut blocks = Vec::new();
    let mut cur = (left, right);
    let neuron_count = loop {
        let (block_id, rest) = cur;
        let Some(rest) = rest else {
            return fail("invalid expression tree");
        };
        blocks.push(evaluate(env, arena, block_id));
        match arena.node(rest) {
            ExpNode::Op {
                op: OpCode::SumBlock,
                left,
                right,
            } => cur = (*left, *right),
            _ => break evaluate(env, arena, rest).as_u32(),
        }
    };

    if blocks.is_empty() {
        return fail("requires at least one operand");
    }
    if neuron_count == 0 {
        return fail("number of neurons must be > 0");
    }
    let bits_per_block = blocks[0].bits();
    if bits_per_block == 0 {
        return fail("operand width must be positive");
    }
    if blocks.iter().any(|b| b.bits() != bits_per_block) {
        return fail("all operands must have the same width");
    }
    if bits_per_block % neuron_count != 0 {
        return fail("operand width must be divisible by neuron count");
    }
    let chunk_width = bits_per_block / neuron_count;

    let mut accum = vec![0u64; neuron_count as usize];
    for block in &blocks {
        let chunks = match codec::extract_chunks(block, chunk_width, neuron_count) {
            Ok(c) => c,
            Err(_) => return fail("failed to split operand bits"),
        };
        for (acc, chunk) in accum.iter_mut().zip(chunks) {
            *acc = acc.saturating_add(chunk);
        }
    }
    let max = codec::mask_u64(chunk_width);
    for value in &mut accum {
        if *value > max {
            *value = max;
        }
    }

    let packed = codec::pack_chunks(&accum, chunk_width);
    if env.lvalue_bits != 0 && packed.bits() != env.lvalue_bits {
        warn!(
            "sum_block output width ({}) mismatches field width {}",
            packed.bits(),
            env.lvalue_bits
        );
    }
    packed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::{Activation, NeuronContext};

    fn env<'a>(
        phv: &'a Phv,
        params: &'a [Data],
        neurons: &'a NeuronRegistry,
        sigmoid: &'a SigmoidTable,
    ) -> EvalEnv<'a> {
        EvalEnv {
            phv,
            params,
            neurons,
            sigmoid,
            lvalue_bits: 0,
        }
    }

    fn fixture() -> (Phv, NeuronRegistry, SigmoidTable) {
        (
            Phv::new(&[0u8; 64], 0).unwrap(),
            NeuronRegistry::new(),
            SigmoidTable::new(),
        )
    }

    fn constant(arena: &mut ExpArena, bits: u32, v: u32) -> ExpId {
        arena.push(ExpNode::Constant(Data::from_u32(bits, v)))
    }

    fn op(arena: &mut ExpArena, op: OpCode, left: ExpId, right: ExpId) -> ExpId {
        arena.push(ExpNode::Op {
            op,
            left,
            right: Some(right),
        })
    }

    #[test]
    fn arithmetic_produces_32_bit_results() {
        let (phv, neurons, sigmoid) = fixture();
        let mut arena = ExpArena::new();
        let a = constant(&mut arena, 8, 200);
        let b = constant(&mut arena, 8, 100);
        let add = op(&mut arena, OpCode::Add, a, b);
        let sub = op(&mut arena, OpCode::Sub, b, a);
        let mul = op(&mut arena, OpCode::Mul, a, b);
        let div = op(&mut arena, OpCode::Div, a, b);

        let e = env(&phv, &[], &neurons, &sigmoid);
        assert_eq!(evaluate(&e, &arena, add).as_u32(), 300);
        assert_eq!(evaluate(&e, &arena, add).bits(), 32);
        assert_eq!(evaluate(&e, &arena, sub).as_u32(), 100u32.wrapping_sub(200));
        assert_eq!(evaluate(&e, &arena, mul).as_u32(), 20_000);
        assert_eq!(evaluate(&e, &arena, div).as_u32(), 2);
    }

    #[test]
    fn multiply_truncates_to_low_32() {
        let (phv, neurons, sigmoid) = fixture();
        let mut arena = ExpArena::new();
        let a = constant(&mut arena, 32, 0x8000_0000);
        let b = constant(&mut arena, 32, 4);
        let mul = op(&mut arena, OpCode::Mul, a, b);
        let e = env(&phv, &[], &neurons, &sigmoid);
        assert_eq!(evaluate(&e, &arena, mul).as_u32(), 0);
    }

    #[test]
    fn divide_by_zero_yields_zero() {
        let (phv, neurons, sigmoid) = fixture();
        let mut arena = ExpArena::new();
        let a = constant(&mut arena, 32, 77);
        let z = constant(&mut arena, 32, 0);
        let div = op(&mut arena, OpCode::Div, a, z);
        let e = env(&phv, &[], &neurons, &sigmoid);
        assert_eq!(evaluate(&e, &arena, div).as_u32(), 0);
    }

    #[test]
    fn shift_left_masks_to_operand_width() {
        let (phv, neurons, sigmoid) = fixture();
        let mut arena = ExpArena::new();
        let a = constant(&mut arena, 8, 0xF0);
        let s = constant(&mut arena, 8, 4);
        let shl = op(&mut arena, OpCode::ShiftLeft, a, s);
        let e = env(&phv, &[], &neurons, &sigmoid);
        let out = evaluate(&e, &arena, shl);
        assert_eq!(out.bits(), 8);
        assert_eq!(out.as_u32(), 0x00); // 0xF0 << 4 leaves nothing in 8 bits
    }

    #[test]
    fn shift_right_keeps_operand_width() {
        let (phv, neurons, sigmoid) = fixture();
        let mut arena = ExpArena::new();
        let a = constant(&mut arena, 16, 0x0F00);
        let s = constant(&mut arena, 8, 8);
        let shr = op(&mut arena, OpCode::ShiftRight, a, s);
        let e = env(&phv, &[], &neurons, &sigmoid);
        let out = evaluate(&e, &arena, shr);
        assert_eq!(out.bits(), 16);
        assert_eq!(out.as_u32(), 0x0F);
    }

    #[test]
    fn bitwise_ops_keep_left_width() {
        let (phv, neurons, sigmoid) = fixture();
        let mut arena = ExpArena::new();
        let a = constant(&mut arena, 12, 0xABC);
        let b = constant(&mut arena, 12, 0x0F0);
        let and = op(&mut arena, OpCode::BitAnd, a, b);
        let or = op(&mut arena, OpCode::BitOr, a, b);
        let xor = op(&mut arena, OpCode::BitXor, a, b);
        let neg = arena.push(ExpNode::Op {
            op: OpCode::BitNeg,
            left: a,
            right: None,
        });
        let e = env(&phv, &[], &neurons, &sigmoid);
        assert_eq!(evaluate(&e, &arena, and).as_u32(), 0x0B0);
        assert_eq!(evaluate(&e, &arena, or).as_u32(), 0xAFC);
        assert_eq!(evaluate(&e, &arena, xor).as_u32(), 0xA4C);
        assert_eq!(evaluate(&e, &arena, neg).as_u32(), !0xABCu32 & 0xFFF);
        assert_eq!(evaluate(&e, &arena, neg).bits(), 12);
    }

    #[test]
    fn params_resolve_by_index() {
        let (phv, neurons, sigmoid) = fixture();
        let mut arena = ExpArena::new();
        let p0 = arena.push(ExpNode::Param(0));
        let p9 = arena.push(ExpNode::Param(9));
        let params = [Data::from_u32(16, 0x1234)];
        let e = env(&phv, &params, &neurons, &sigmoid);
        assert_eq!(evaluate(&e, &arena, p0).as_u32(), 0x1234);
        // Out-of-range parameter degrades to zero.
        assert_eq!(evaluate(&e, &arena, p9).as_u32(), 0);
    }

    #[test]
    fn field_reads_go_through_the_phv() {
        let (mut phv, neurons, sigmoid) = fixture();
        phv.mark_header(1, 0, 32);
        phv.packet_mut()[0..4].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        let mut arena = ExpArena::new();
        let fd = arena.push(ExpNode::Field(FieldInfo::field(1, 8, 16)));
        let e = env(&phv, &[], &neurons, &sigmoid);
        assert_eq!(evaluate(&e, &arena, fd).as_u32(), 0xADBE);
    }

    #[test]
    fn neuron_primitive_runs_via_registry() {
        let (phv, neurons, sigmoid) = fixture();
        neurons
            .upsert(NeuronContext {
                context_id: 7,
                num_inputs: 2,
                num_neurons: 1,
                input_bitwidth: 16,
                output_bitwidth: 16,
                inputs_signed: true,
                weights_signed: true,
                weights: vec![1 << 16, 2 << 16],
                biases: vec![0],
                activation: Activation::Relu,
            })
            .unwrap();
        let mut arena = ExpArena::new();
        let features = arena.push(ExpNode::Constant(codec::pack_chunks(
            &[3u64, 0xFFFF], // [3, -1] as signed 16-bit
            16,
        )));
        let ctx_id = constant(&mut arena, 16, 7);
        let np = op(&mut arena, OpCode::NeuronPrimitive, features, ctx_id);
        let mut e = env(&phv, &[], &neurons, &sigmoid);
        e.lvalue_bits = 16;
        assert_eq!(evaluate(&e, &arena, np).as_u32(), 1);
    }

    #[test]
    fn missing_neuron_context_degrades_to_zero() {
        let (phv, neurons, sigmoid) = fixture();
        let mut arena = ExpArena::new();
        let features = constant(&mut arena, 16, 0);
        let ctx_id = constant(&mut arena, 16, 42);
        let np = op(&mut arena, OpCode::NeuronPrimitive, features, ctx_id);
        let mut e = env(&phv, &[], &neurons, &sigmoid);
        e.lvalue_bits = 16;
        let out = evaluate(&e, &arena, np);
        assert_eq!(out.bits(), 16);
        assert_eq!(out.as_u32(), 0);
    }

    #[test]
    fn sum_block_sums_and_saturates() {
        let (phv, neurons, sigmoid) = fixture();
        let mut arena = ExpArena::new();
        // sum_block(0x0305, sum_block(0x0402, 2))
        let a = constant(&mut arena, 16, 0x0305);
        let b = constant(&mut arena, 16, 0x0402);
        let n = constant(&mut arena, 8, 2);
        let inner = op(&mut arena, OpCode::SumBlock, b, n);
        let outer = op(&mut arena, OpCode::SumBlock, a, inner);
        let e = env(&phv, &[], &neurons, &sigmoid);
        let out = evaluate(&e, &arena, outer);
        assert_eq!(out.bits(), 16);
        assert_eq!(out.as_u32(), 0x0707);

        // A third block pushes chunk 1 past 0xFF: it saturates.
        let mut arena = ExpArena::new();
        let a = constant(&mut arena, 16, 0x0305);
        let b = constant(&mut arena, 16, 0x0402);
        let c = constant(&mut arena, 16, 0x01FF);
        let n = constant(&mut arena, 8, 2);
        let inner2 = op(&mut arena, OpCode::SumBlock, c, n);
        let inner1 = op(&mut arena, OpCode::SumBlock, b, inner2);
        let outer = op(&mut arena, OpCode::SumBlock, a, inner1);
        let out = evaluate(&e, &arena, outer);
        assert_eq!(out.as_u32(), 0x08FF);
    }

    #[test]
    fn sum_block_rejects_mismatched_widths() {
        let (phv, neurons, sigmoid) = fixture();
        let mut arena = ExpArena::new();
        let a = constant(&mut arena, 16, 0x0305);
        let b = constant(&mut arena, 8, 0x42);
        let n = constant(&mut arena, 8, 2);
        let inner = op(&mut arena, OpCode::SumBlock, b, n);
        let outer = op(&mut arena, OpCode::SumBlock, a, inner);
        let mut e = env(&phv, &[], &neurons, &sigmoid);
        e.lvalue_bits = 16;
        let out = evaluate(&e, &arena, outer);
        assert_eq!(out.bits(), 16);
        assert_eq!(out.as_u32(), 0);
    }

    #[test]
    fn sum_block_rejects_indivisible_width() {
        let (phv, neurons, sigmoid) = fixture();
        let mut arena = ExpArena::new();
        let a = constant(&mut arena, 16, 0x0305);
        let n = constant(&mut arena, 8, 3);
        let outer = op(&mut arena, OpCode::SumBlock, a, n);
        let e = env(&phv, &[], &neurons, &sigmoid);
        assert_eq!(evaluate(&e, &arena, outer).as_u32(), 0);
    }
}
