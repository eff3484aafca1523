//! Software data plane for the reconfigurable match-table switch.
//!
//! The pipeline is up to sixteen addressable **processors**; each combines a
//! programmable **parser** (TCAM-style state machine), a boolean
//! **gateway**, a **matcher** bank (exact/ternary/LPM tables over simulated
//! SRAM/TCAM blocks) and an **executor** whose match actions are expression
//! trees with arithmetic, bitwise, table-lookup and neural accelerator
//! operations.
//!
//! ```text
//!            ┌──────────────── processor ────────────────┐
//! bytes ──►  parser ──► gateway ──► matcher ──► executor ──► next processor
//!            (PHV: packet bytes + parsed-header geometry + match state)
//! ```
//!
//! # Quick start
//!
//! ```
//! use rmt_dataplane::prelude::*;
//! use std::sync::{Arc, RwLock};
//!
//! let pipeline = Arc::new(RwLock::new(Pipeline::new()));
//! let mut ctrl = CtrlService::new();
//! ctrl.install(Arc::clone(&pipeline));
//!
//! // Parse a 14-byte Ethernet header on every packet.
//! let resp = ctrl.dispatch(CtrlRequest::InitParserLevel { proc_id: 0, levels: 1 });
//! assert_eq!(resp.status, CtrlStatus::Ok);
//!
//! let frame = vec![0u8; 60];
//! let out = pipeline.read().unwrap().process(&frame, 0).unwrap();
//! assert!(out.is_some());
//! ```
//!
//! Configuration arrives over the typed control bus ([`CtrlService`]);
//! packets go through [`Pipeline::process`]. The control service takes the
//! pipeline's write lock per mutation, packet workers hold the read lock
//! per traversal, and the accelerator registries carry their own mutexes
//! with copy-out snapshots.

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_precision_loss)]

pub mod accel;
pub mod codec;
pub mod control;
pub mod error;
pub mod executor;
pub mod expr;
pub mod gateway;
pub mod matcher;
pub mod parser;
pub mod phv;
pub mod pipeline;
pub mod processor;
pub mod render;
pub mod types;

pub use accel::{Activation, ExpTable, NeuronContext, NeuronRegistry, SigmoidTable};
pub use codec::Data;
pub use control::{
    ActionSpec, CtrlRequest, CtrlResponse, CtrlService, CtrlStatus, ExpSpec, PrimitiveSpec,
};
pub use error::{DataplaneError, Result};
pub use executor::{Action, Executor, Primitive};
pub use expr::{ExpArena, ExpId, ExpNode, OpCode};
pub use gateway::{GateParam, Gateway, RelationExp};
pub use matcher::{Matcher, MemConfig};
pub use parser::{Parser, ParserEntry};
pub use phv::Phv;
pub use pipeline::{EgressFrame, Pipeline};
pub use processor::Processor;
pub use types::{
    FieldInfo, FieldType, GateEntry, GateEntryType, HeaderInfo, MatchType, MissAction,
    RelationCode,
};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        ActionSpec, CtrlRequest, CtrlResponse, CtrlService, CtrlStatus, Data, EgressFrame,
        ExpSpec, FieldInfo, FieldType, GateEntry, MatchType, MemConfig, MissAction, NeuronContext,
        ParserEntry, Phv, Pipeline, PrimitiveSpec, RelationCode, Result,
    };
}
