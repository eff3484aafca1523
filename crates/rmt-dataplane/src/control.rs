//! Control-plane bus.
//!
//! The runtime is configured through a typed request/response surface. The
//! transport is somebody else's problem: whatever carries
//! [`CtrlRequest`] values to [`CtrlService::dispatch`] gets a
//! [`CtrlResponse`] back. Every call is synchronous and answers `Ok`,
//! `Fail` (with a reason) or `Cancelled` — the latter exactly when no
//! pipeline handle has been installed yet.
//!
//! Action bodies arrive as [`ActionSpec`] trees and are lowered into the
//! action's expression arena at install time, so the running configuration
//! owns all of its nodes.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::info;

use crate::accel::NeuronContext;
use crate::codec::Data;
use crate::error::{DataplaneError, Result};
use crate::executor::{Action, Primitive};
use crate::expr::{ExpArena, ExpId, ExpNode, OpCode};
use crate::gateway::RelationExp;
use crate::matcher::MemConfig;
use crate::parser::ParserEntry;
use crate::pipeline::Pipeline;
use crate::types::{FieldInfo, GateEntry, HeaderInfo};

/// A build-friendly expression tree, lowered into an [`ExpArena`] on
/// install.
#[derive(Debug, Clone)]
pub enum ExpSpec {
    /// A literal.
    Constant(Data),
    /// A field read.
    Field(FieldInfo),
    /// An action parameter by index.
    Param(u8),
    /// An operator node.
    Op {
        /// Operator to apply.
        op: OpCode,
        /// Left (or only) operand.
        left: Box<ExpSpec>,
        /// Right operand; `None` for unary operators.
        right: Option<Box<ExpSpec>>,
    },
}

impl ExpSpec {
    /// A constant of `bits` width holding `v`.
    #[must_use]
    pub fn constant(bits: u32, v: u32) -> Self {
        Self::Constant(Data::from_u32(bits, v))
    }

    /// A field read.
    #[must_use]
    pub fn field(fd: FieldInfo) -> Self {
        Self::Field(fd)
    }

    /// An action parameter.
    #[must_use]
    pub fn param(idx: u8) -> Self {
        Self::Param(idx)
    }

    /// A binary operator node.
    #[must_use]
    pub fn binary(op: OpCode, left: Self, right: Self) -> Self {
        Self::Op {
            op,
            left: Box::new(left),
            right: Some(Box::new(right)),
        }
    }

    /// A unary operator node.
    #[must_use]
    pub fn unary(op: OpCode, operand: Self) -> Self {
        Self::Op {
            op,
            left: Box::new(operand),
            right: None,
        }
    }

    fn lower(&self, arena: &mut ExpArena) -> ExpId {
        match self {
            Self::Constant(d) => arena.push(ExpNode::Constant(d.clone())),
            Self::Field(fd) => arena.push(ExpNode::Field(*fd)),
            Self::Param(idx) => arena.push(ExpNode::Param(*idx)),
            Self::Op { op, left, right } => {
                let left = left.lower(arena);
                let right = right.as_ref().map(|r| r.lower(arena));
                arena.push(ExpNode::Op {
                    op: *op,
                    left,
                    right,
                })
            }
        }
    }
}

/// One primitive of an action body.
#[derive(Debug, Clone)]
pub struct PrimitiveSpec {
    /// Destination field.
    pub lvalue: FieldInfo,
    /// Right-hand expression.
    pub rvalue: ExpSpec,
}

/// An action body: primitives plus the parameter layout.
#[derive(Debug, Clone, Default)]
pub struct ActionSpec {
    /// Primitives in execution order.
    pub primitives: Vec<PrimitiveSpec>,
    /// Bit width of each packed parameter.
    pub para_lens: Vec<u16>,
}

impl ActionSpec {
    fn lower(&self) -> Action {
        let mut arena = ExpArena::new();
        let primitives = self
            .primitives
            .iter()
            .map(|p| Primitive {
                lvalue: p.lvalue,
                root: p.rvalue.lower(&mut arena),
            })
            .collect();
        Action {
            primitives,
            arena,
            para_lens: self.para_lens.clone(),
        }
    }
}

/// Every operation the control plane can request.
#[derive(Debug, Clone)]
pub enum CtrlRequest {
    /// Install the pipeline-wide metadata header map.
    SetMetadata {
        /// Metadata headers, offsets relative to the metadata region.
        headers: Vec<HeaderInfo>,
    },
    /// Size a processor's parser level table.
    InitParserLevel {
        /// Target processor.
        proc_id: i32,
        /// Level count.
        levels: usize,
    },
    /// Install or update one parser entry.
    ModParserEntry {
        /// Target processor.
        proc_id: i32,
        /// Target level.
        level: usize,
        /// Entry body (field descriptors are owned copies).
        entry: ParserEntry,
    },
    /// Discard a processor's parser configuration.
    ClearParser {
        /// Target processor.
        proc_id: i32,
    },
    /// Append one gateway expression.
    InsertRelationExp {
        /// Target processor.
        proc_id: i32,
        /// The expression.
        exp: RelationExp,
    },
    /// Discard a processor's gateway expressions.
    ClearRelationExp {
        /// Target processor.
        proc_id: i32,
    },
    /// Map a gateway bitmap to a verdict.
    ModResMap {
        /// Target processor.
        proc_id: i32,
        /// Bitmap to map.
        bitmap: u32,
        /// Verdict.
        entry: GateEntry,
    },
    /// Discard a processor's gateway bitmap map.
    ClearResMap {
        /// Target processor.
        proc_id: i32,
    },
    /// Set a processor's default gateway verdict.
    SetDefaultGateEntry {
        /// Target processor.
        proc_id: i32,
        /// Default verdict.
        entry: GateEntry,
    },
    /// Wipe and reinstall one matcher's memory.
    SetMemConfig {
        /// Target processor.
        proc_id: i32,
        /// Target matcher slot.
        matcher_id: i32,
        /// Memory descriptor.
        cfg: MemConfig,
    },
    /// Install a matcher's key field slices.
    SetFieldInfo {
        /// Target processor.
        proc_id: i32,
        /// Target matcher slot.
        matcher_id: i32,
        /// Key field slices, concatenated left-to-right.
        fields: Vec<FieldInfo>,
    },
    /// Install a matcher's action-to-next-processor map.
    SetActionProc {
        /// Target processor.
        proc_id: i32,
        /// Target matcher slot.
        matcher_id: i32,
        /// Action id → next processor id.
        map: HashMap<i32, i32>,
    },
    /// Set a matcher's pass-through mode.
    SetNoTable {
        /// Target processor.
        proc_id: i32,
        /// Target matcher slot.
        matcher_id: i32,
        /// Pass-through flag.
        no_table: bool,
    },
    /// Set a matcher's miss action id.
    SetMissActId {
        /// Target processor.
        proc_id: i32,
        /// Target matcher slot.
        matcher_id: i32,
        /// Action on miss.
        miss_act_id: i32,
    },
    /// Install one exact entry.
    InsertSramEntry {
        /// Target processor.
        proc_id: i32,
        /// Target matcher slot.
        matcher_id: i32,
        /// Key bytes, right-aligned into the key width.
        key: Vec<u8>,
        /// Value slot bytes, right-aligned into the value width.
        value: Vec<u8>,
    },
    /// Install one ternary/LPM entry.
    InsertTcamEntry {
        /// Target processor.
        proc_id: i32,
        /// Target matcher slot.
        matcher_id: i32,
        /// Key bytes.
        key: Vec<u8>,
        /// Mask bytes.
        mask: Vec<u8>,
        /// Value slot bytes.
        value: Vec<u8>,
    },
    /// Wipe one matcher.
    ClearOldConfig {
        /// Target processor.
        proc_id: i32,
        /// Target matcher slot.
        matcher_id: i32,
    },
    /// Install an action.
    InsertAction {
        /// Target processor.
        proc_id: i32,
        /// Action id.
        action_id: i32,
        /// Action body.
        action: ActionSpec,
    },
    /// Remove one action.
    DelAction {
        /// Target processor.
        proc_id: i32,
        /// Action id.
        action_id: i32,
    },
    /// Remove a processor's whole action table.
    ClearAction {
        /// Target processor.
        proc_id: i32,
    },
    /// Validate and install a neuron context.
    LoadNeuronPrimitiveContext {
        /// Context body.
        context: NeuronContext,
    },
    /// Remove one neuron context.
    EraseNeuronPrimitiveContext {
        /// Context id.
        context_id: u16,
    },
    /// Remove every neuron context.
    ClearNeuronPrimitiveContexts,
    /// Load the sigmoid table from an unordered point list.
    LoadSigmoidTable {
        /// `(scaled input, value)` points; must cover their range without
        /// gaps.
        points: Vec<(i32, u32)>,
        /// Bit width of the stored values.
        value_bitwidth: u32,
        /// Input multiplier (zero is coerced to one).
        input_multiplier: u32,
    },
    /// Drop the sigmoid table.
    ClearSigmoidTable,
    /// Load the exp table from an unordered point list.
    LoadExpTable {
        /// `(scaled input, value)` points; must cover their range without
        /// gaps.
        points: Vec<(i32, u32)>,
        /// Input multiplier (zero is coerced to one).
        input_multiplier: u32,
        /// Value scale (zero is coerced to one).
        value_scale: u32,
    },
    /// Drop the exp table.
    ClearExpTable,
}

/// Outcome of a control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrlStatus {
    /// The mutation was applied.
    Ok,
    /// The request was rejected; nothing was mutated.
    Fail,
    /// No pipeline handle is installed.
    Cancelled,
}

/// Response to one control request.
#[derive(Debug, Clone)]
pub struct CtrlResponse {
    /// Outcome.
    pub status: CtrlStatus,
    /// Failure reason, when `status` is `Fail`.
    pub detail: Option<String>,
}

impl CtrlResponse {
    fn ok() -> Self {
        Self {
            status: CtrlStatus::Ok,
            detail: None,
        }
    }

    fn fail(detail: String) -> Self {
        Self {
            status: CtrlStatus::Fail,
            detail: Some(detail),
        }
    }

    fn cancelled() -> Self {
        Self {
            status: CtrlStatus::Cancelled,
            detail: None,
        }
    }
}

/// The control service: an optional pipeline handle plus the dispatcher.
///
/// Control calls take the pipeline's write lock for the duration of one
/// mutation; packet workers hold the read lock for one whole traversal.
#[derive(Debug, Default)]
pub struct CtrlService {
    pipeline: Option<Arc<RwLock<Pipeline>>>,
}

impl CtrlService {
    /// Service with no pipeline installed; every request is `Cancelled`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the pipeline handle.
    pub fn install(&mut self, pipeline: Arc<RwLock<Pipeline>>) {
        info!("pipeline handle installed");
        self.pipeline = Some(pipeline);
    }

    /// Whether a pipeline handle is installed.
    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.pipeline.is_some()
    }

    /// Apply one request and report the outcome.
    #[must_use]
    pub fn dispatch(&self, request: CtrlRequest) -> CtrlResponse {
        let Some(handle) = &self.pipeline else {
            return CtrlResponse::cancelled();
        };
        let mut ppl = handle.write().unwrap_or_else(|e| e.into_inner());
        match Self::apply(&mut ppl, request) {
            Ok(()) => CtrlResponse::ok(),
            Err(e) => CtrlResponse::fail(e.to_string()),
        }
    }

    fn apply(ppl: &mut Pipeline, request: CtrlRequest) -> Result<()> {
        match request {
            CtrlRequest::SetMetadata { headers } => {
                ppl.set_metadata(headers);
                Ok(())
            }
            CtrlRequest::InitParserLevel { proc_id, levels } => {
                ppl.init_parser_level(proc_id, levels)
            }
            CtrlRequest::ModParserEntry {
                proc_id,
                level,
                entry,
            } => ppl.modify_parser_entry(proc_id, level, entry),
            CtrlRequest::ClearParser { proc_id } => ppl.clear_parser(proc_id),
            CtrlRequest::InsertRelationExp { proc_id, exp } => {
                ppl.insert_relation_exp(proc_id, exp)
            }
            CtrlRequest::ClearRelationExp { proc_id } => ppl.clear_relation_exp(proc_id),
            CtrlRequest::ModResMap {
                proc_id,
                bitmap,
                entry,
            } => ppl.mod_res_map(proc_id, bitmap, entry),
            CtrlRequest::ClearResMap { proc_id } => ppl.clear_res_map(proc_id),
            CtrlRequest::SetDefaultGateEntry { proc_id, entry } => {
                ppl.set_default_gate_entry(proc_id, entry)
            }
            CtrlRequest::SetMemConfig {
                proc_id,
                matcher_id,
                cfg,
            } => ppl.set_mem_config(proc_id, matcher_id, cfg),
            CtrlRequest::SetFieldInfo {
                proc_id,
                matcher_id,
                fields,
            } => ppl.set_field_info(proc_id, matcher_id, fields),
            CtrlRequest::SetActionProc {
                proc_id,
                matcher_id,
                map,
            } => ppl.set_action_proc(proc_id, matcher_id, map),
            CtrlRequest::SetNoTable {
                proc_id,
                matcher_id,
                no_table,
            } => ppl.set_no_table(proc_id, matcher_id, no_table),
            CtrlRequest::SetMissActId {
                proc_id,
                matcher_id,
                miss_act_id,
            } => ppl.set_miss_act_id(proc_id, matcher_id, miss_act_id),
            CtrlRequest::InsertSramEntry {
                proc_id,
                matcher_id,
                key,
                value,
            } => ppl.insert_sram_entry(proc_id, matcher_id, &key, &value),
            CtrlRequest::InsertTcamEntry {
                proc_id,
                matcher_id,
                key,
                mask,
                value,
            } => ppl.insert_tcam_entry(proc_id, matcher_id, &key, &mask, &value),
            CtrlRequest::ClearOldConfig {
                proc_id,
                matcher_id,
            } => ppl.clear_old_config(proc_id, matcher_id),
            CtrlRequest::InsertAction {
                proc_id,
                action_id,
                action,
            } => ppl.insert_action(proc_id, action_id, action.lower()),
            CtrlRequest::DelAction { proc_id, action_id } => ppl.del_action(proc_id, action_id),
            CtrlRequest::ClearAction { proc_id } => ppl.clear_action(proc_id),
            CtrlRequest::LoadNeuronPrimitiveContext { context } => ppl.neurons().upsert(context),
            CtrlRequest::EraseNeuronPrimitiveContext { context_id } => {
                ppl.neurons().erase(context_id);
                Ok(())
            }
            CtrlRequest::ClearNeuronPrimitiveContexts => {
                ppl.neurons().clear();
                Ok(())
            }
            CtrlRequest::LoadSigmoidTable {
                points,
                value_bitwidth,
                input_multiplier,
            } => {
                let (min_input, max_input, values) = densify_points(&points, "sigmoid table")?;
                let input_multiplier = input_multiplier.max(1);
                ppl.sigmoid()
                    .load(min_input, max_input, value_bitwidth, input_multiplier, values)
            }
            CtrlRequest::ClearSigmoidTable => {
                ppl.sigmoid().clear();
                Ok(())
            }
            CtrlRequest::LoadExpTable {
                points,
                input_multiplier,
                value_scale,
            } => {
                let (min_input, max_input, values) = densify_points(&points, "exp table")?;
                let input_multiplier = input_multiplier.max(1);
                let value_scale = value_scale.max(1);
                ppl.exp()
                    .load(min_input, max_input, input_multiplier, value_scale, values)
            }
            CtrlRequest::ClearExpTable => {
                ppl.exp().clear();
                Ok(())
            }
        }
    }
}

/// Turn an unordered `(input, value)` point list into a dense value vector
/// over `[min, max]`, rejecting empty lists and gaps.
fn densify_points(points: &[(i32, u32)], what: &str) -> Result<(i32, i32, Vec<u32>)> {
    if points.is_empty() {
        return Err(DataplaneError::config_invalid(format!(
            "{what}: no entries provided"
        )));
    }
    let mut map = HashMap::with_capacity(points.len());
    let mut min_input = i32::MAX;
    let mut max_input = i32::MIN;
    for &(input, value) in points {
        min_input = min_input.min(input);
        max_input = max_input.max(input);
        map.insert(input, value);
    }
    let mut values = Vec::with_capacity((i64::from(max_input) - i64::from(min_input) + 1) as usize);
    for key in min_input..=max_input {
        let Some(&value) = map.get(&key) else {
            return Err(DataplaneError::config_invalid(format!(
                "{what}: missing entry for input {key} between {min_input} and {max_input}"
            )));
        };
        values.push(value);
    }
    Ok((min_input, max_input, values))
}
