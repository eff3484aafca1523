//! Action executor.
//!
//! An executor holds up to 32 actions. Each action is an ordered list of
//! primitives (`lvalue ← expression`) plus a parameter layout. When a
//! matcher resolves an action, the executor slices the published value slot
//! into parameters — bits 0..16 are the slot header, parameters start at
//! bit 16 — and runs the primitives in order. A later primitive observes
//! every earlier primitive's writes.

use rmt_chip::geometry::EXECUTOR_ACTIONS;
use tracing::{debug, error};

use crate::accel::{NeuronRegistry, SigmoidTable};
use crate::codec::{self, Data};
use crate::error::{DataplaneError, Result};
use crate::expr::{evaluate, EvalEnv, ExpArena, ExpId};
use crate::phv::Phv;
use crate::types::FieldInfo;

/// First parameter bit inside a value slot (the 16-bit header precedes it).
pub const PARAM_REGION_START: u16 = 16;

/// One `lvalue ← rvalue` assignment.
#[derive(Debug, Clone)]
pub struct Primitive {
    /// Destination field.
    pub lvalue: FieldInfo,
    /// Root of the right-hand expression tree in the action's arena.
    pub root: ExpId,
}

/// One action: primitives, their expression arena, and the parameter
/// layout expected in the value slot.
#[derive(Debug, Clone, Default)]
pub struct Action {
    /// Primitives in execution order.
    pub primitives: Vec<Primitive>,
    /// Arena owning every expression node of this action.
    pub arena: ExpArena,
    /// Bit width of each packed parameter.
    pub para_lens: Vec<u16>,
}

impl Action {
    /// Expected parameter count.
    #[must_use]
    pub fn para_num(&self) -> usize {
        self.para_lens.len()
    }
}

/// One processor's action table.
#[derive(Debug)]
pub struct Executor {
    actions: Vec<Option<Action>>,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    /// Empty action table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            actions: (0..EXECUTOR_ACTIONS).map(|_| None).collect(),
        }
    }

    /// Install an action at an id, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns [`DataplaneError::InvalidAction`] when the id is out of
    /// range.
    pub fn insert_action(&mut self, action_id: i32, action: Action) -> Result<()> {
        let slot = self.slot_mut(action_id)?;
        *slot = Some(action);
        Ok(())
    }

    /// Remove one action.
    ///
    /// # Errors
    ///
    /// Returns [`DataplaneError::InvalidAction`] when the id is out of
    /// range.
    pub fn del_action(&mut self, action_id: i32) -> Result<()> {
        let slot = self.slot_mut(action_id)?;
        *slot = None;
        Ok(())
    }

    /// Remove every action.
    pub fn clear(&mut self) {
        for slot in &mut self.actions {
            *slot = None;
        }
    }

    /// Installed action count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.iter().filter(|a| a.is_some()).count()
    }

    /// Whether no actions are installed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot_mut(&mut self, action_id: i32) -> Result<&mut Option<Action>> {
        usize::try_from(action_id)
            .ok()
            .and_then(|id| self.actions.get_mut(id))
            .ok_or(DataplaneError::InvalidAction {
                action_id,
                count: EXECUTOR_ACTIONS,
            })
    }

    /// Run the action the matcher resolved into the PHV.
    ///
    /// An unresolvable action id is a quiet no-op: unconfigured processors
    /// forward packets untouched.
    pub fn execute(&self, phv: &mut Phv, neurons: &NeuronRegistry, sigmoid: &SigmoidTable) {
        let action_id = phv.next_action_id;
        let Some(action) = usize::try_from(action_id)
            .ok()
            .and_then(|id| self.actions.get(id))
            .and_then(Option::as_ref)
        else {
            debug!(action_id, "no action installed, skipping executor");
            return;
        };

        let params = unpack_params(phv.match_value(), phv.match_value_len(), &action.para_lens);
        for prim in &action.primitives {
            let value = {
                let env = EvalEnv {
                    phv,
                    params: &params,
                    neurons,
                    sigmoid,
                    lvalue_bits: u32::from(prim.lvalue.fd_len),
                };
                evaluate(&env, &action.arena, prim.root)
            };
            if let Err(e) = phv.write_field(&prim.lvalue, &value) {
                error!("primitive write failed: {e}");
            }
        }
    }
}

/// Slice a value slot into right-aligned parameter values.
///
/// Parameters are packed back to back starting at bit
/// [`PARAM_REGION_START`]. A slot too short for a declared parameter yields
/// a zero value of that parameter's width.
#[must_use]
pub fn unpack_params(slot: &[u8], slot_bits: u16, para_lens: &[u16]) -> Vec<Data> {
    let mut params = Vec::with_capacity(para_lens.len());
    let mut cursor = PARAM_REGION_START;
    for &len in para_lens {
        let end = cursor + len;
        if end > slot_bits {
            debug!(
                "value slot of {slot_bits} bits too short for parameter bits {cursor}..{end}"
            );
            params.push(Data::zero(u32::from(len)));
        } else {
            match codec::read_bits(slot, usize::from(cursor), len) {
                Ok(d) => params.push(d),
                Err(_) => params.push(Data::zero(u32::from(len))),
            }
        }
        cursor = end;
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{ExpNode, OpCode};

    fn registries() -> (NeuronRegistry, SigmoidTable) {
        (NeuronRegistry::new(), SigmoidTable::new())
    }

    /// Action: `ipv4.ttl ← ipv4.ttl − 1` (TTL at bit 64 of header 2).
    fn ttl_decrement() -> Action {
        let mut arena = ExpArena::new();
        let ttl = arena.push(ExpNode::Field(FieldInfo::field(2, 64, 8)));
        let one = arena.push(ExpNode::Constant(Data::from_u32(8, 1)));
        let sub = arena.push(ExpNode::Op {
            op: OpCode::Sub,
            left: ttl,
            right: Some(one),
        });
        Action {
            primitives: vec![Primitive {
                lvalue: FieldInfo::field(2, 64, 8),
                root: sub,
            }],
            arena,
            para_lens: Vec::new(),
        }
    }

    fn ipv4_phv(ttl: u8) -> Phv {
        let mut frame = vec![0u8; 64];
        frame[22] = ttl;
        let mut phv = Phv::new(&frame, 0).unwrap();
        phv.mark_header(1, 0, 112);
        phv.mark_header(2, 112, 160);
        phv
    }

    #[test]
    fn unpack_skips_the_slot_header() {
        // Slot: action id 5, then params 12 and 4 bits wide.
        // Bits 16..28 = 0xABC, bits 28..32 = 0xD.
        let slot = [0x05, 0x00, 0xAB, 0xCD];
        let params = unpack_params(&slot, 32, &[12, 4]);
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].as_u32(), 0xABC);
        assert_eq!(params[0].bits(), 12);
        assert_eq!(params[1].as_u32(), 0xD);
    }

    #[test]
    fn unpack_zero_fills_past_the_slot() {
        let slot = [0x05, 0x00];
        let params = unpack_params(&slot, 16, &[8]);
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].as_u32(), 0);
    }

    #[test]
    fn ttl_decrement_edits_only_the_ttl() {
        let (neurons, sigmoid) = registries();
        let mut ex = Executor::new();
        ex.insert_action(1, ttl_decrement()).unwrap();

        let mut phv = ipv4_phv(64);
        let before = phv.egress_frame();
        phv.hit = true;
        phv.next_action_id = 1;
        ex.execute(&mut phv, &neurons, &sigmoid);

        let after = phv.egress_frame();
        assert_eq!(after[22], 63);
        for (i, (a, b)) in before.iter().zip(after.iter()).enumerate() {
            if i != 22 {
                assert_eq!(a, b, "byte {i} changed outside the lvalue");
            }
        }
        // Header geometry is untouched.
        assert_eq!(phv.parsed_header(2).hdr_offset, 112);
    }

    #[test]
    fn later_primitives_see_earlier_writes() {
        let mut arena = ExpArena::new();
        // prim 0: ttl ← 10; prim 1: ttl ← ttl + 5.
        let ten = arena.push(ExpNode::Constant(Data::from_u32(8, 10)));
        let ttl = arena.push(ExpNode::Field(FieldInfo::field(2, 64, 8)));
        let five = arena.push(ExpNode::Constant(Data::from_u32(8, 5)));
        let add = arena.push(ExpNode::Op {
            op: OpCode::Add,
            left: ttl,
            right: Some(five),
        });
        let action = Action {
            primitives: vec![
                Primitive {
                    lvalue: FieldInfo::field(2, 64, 8),
                    root: ten,
                },
                Primitive {
                    lvalue: FieldInfo::field(2, 64, 8),
                    root: add,
                },
            ],
            arena,
            para_lens: Vec::new(),
        };

        let (neurons, sigmoid) = registries();
        let mut ex = Executor::new();
        ex.insert_action(0, action).unwrap();
        let mut phv = ipv4_phv(200);
        phv.next_action_id = 0;
        ex.execute(&mut phv, &neurons, &sigmoid);
        assert_eq!(phv.egress_frame()[22], 15);
    }

    #[test]
    fn parameters_flow_into_primitives() {
        let mut arena = ExpArena::new();
        let p0 = arena.push(ExpNode::Param(0));
        let action = Action {
            primitives: vec![Primitive {
                lvalue: FieldInfo::field(2, 64, 8),
                root: p0,
            }],
            arena,
            para_lens: vec![8],
        };

        let (neurons, sigmoid) = registries();
        let mut ex = Executor::new();
        ex.insert_action(2, action).unwrap();
        let mut phv = ipv4_phv(0);
        // Slot: header 0x02_00, then the 8-bit parameter 0x2A.
        phv.set_match_value(vec![0x02, 0x00, 0x2A], 24);
        phv.next_action_id = 2;
        ex.execute(&mut phv, &neurons, &sigmoid);
        assert_eq!(phv.egress_frame()[22], 0x2A);
    }

    #[test]
    fn valid_lvalue_rewrites_the_bitmap_not_the_packet() {
        let mut arena = ExpArena::new();
        let zero = arena.push(ExpNode::Constant(Data::from_u32(1, 0)));
        let action = Action {
            primitives: vec![Primitive {
                lvalue: FieldInfo::valid(2),
                root: zero,
            }],
            arena,
            para_lens: Vec::new(),
        };

        let (neurons, sigmoid) = registries();
        let mut ex = Executor::new();
        ex.insert_action(0, action).unwrap();
        let mut phv = ipv4_phv(64);
        let before = phv.egress_frame();
        phv.next_action_id = 0;
        ex.execute(&mut phv, &neurons, &sigmoid);
        assert!(!phv.is_valid(2));
        assert_eq!(&before[..], &phv.egress_frame()[..]);
    }

    #[test]
    fn missing_action_is_a_no_op() {
        let (neurons, sigmoid) = registries();
        let ex = Executor::new();
        let mut phv = ipv4_phv(64);
        let before = phv.egress_frame();
        phv.next_action_id = 7;
        ex.execute(&mut phv, &neurons, &sigmoid);
        assert_eq!(&before[..], &phv.egress_frame()[..]);
    }

    #[test]
    fn action_ids_are_bounded() {
        let mut ex = Executor::new();
        assert!(ex.insert_action(-1, Action::default()).is_err());
        assert!(ex
            .insert_action(EXECUTOR_ACTIONS as i32, Action::default())
            .is_err());
        assert!(ex.del_action(99).is_err());
    }
}
