//! The pipeline: sixteen addressable processors, the pipeline-wide metadata
//! header map, the accelerator registries and the packet dispatch loop.
//!
//! Packet flow: the ingress frame is copied into a fresh [`Phv`], the entry
//! processor's parser runs once, then the packet walks processors —
//! gateway → matcher → executor per visit — until a verdict or route names
//! the emit sentinel, the drop flag is raised, or the visit guard trips.
//!
//! Configuration is mutated only through `&mut self` (the control service
//! wraps the pipeline in one `RwLock`: control calls write, packet workers
//! read), so `process` takes `&self` and any number of packets may be in
//! flight against one configuration snapshot.

use bytes::Bytes;
use rmt_chip::geometry::{CLUSTERS, FRONT_HEADER_BYTES, MAX_PROCESSORS};
use rmt_chip::mem::{BlockKind, MemoryPool};
use rmt_chip::ClusterLayout;
use tracing::{debug, warn};

use crate::accel::{ExpTable, NeuronRegistry, SigmoidTable};
use crate::error::{DataplaneError, Result};
use crate::executor::Action;
use crate::gateway::RelationExp;
use crate::matcher::MemConfig;
use crate::parser::ParserEntry;
use crate::phv::Phv;
use crate::processor::Processor;
use crate::types::{GateEntry, GateEntryType, HeaderInfo, MatchType};

/// A packet visits at most this many processors before it is dropped.
const MAX_VISITS: usize = 64;

/// An emitted frame plus its target interface.
#[derive(Debug, Clone)]
pub struct EgressFrame {
    /// Serialized packet bytes.
    pub bytes: Bytes,
    /// Egress interface id.
    pub eg_if: i32,
}

/// The whole data plane.
#[derive(Debug)]
pub struct Pipeline {
    processors: Vec<Processor>,
    metadata: Vec<HeaderInfo>,
    neurons: NeuronRegistry,
    sigmoid: SigmoidTable,
    exp: ExpTable,
    pool: MemoryPool,
}

impl Pipeline {
    /// Pipeline with the reference layout and no configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            processors: (0..MAX_PROCESSORS).map(Processor::new).collect(),
            metadata: Vec::new(),
            neurons: NeuronRegistry::new(),
            sigmoid: SigmoidTable::new(),
            exp: ExpTable::new(),
            pool: MemoryPool::new(ClusterLayout::REFERENCE),
        }
    }

    /// Neuron context registry.
    #[must_use]
    pub fn neurons(&self) -> &NeuronRegistry {
        &self.neurons
    }

    /// Sigmoid lookup table.
    #[must_use]
    pub fn sigmoid(&self) -> &SigmoidTable {
        &self.sigmoid
    }

    /// Exp lookup table.
    #[must_use]
    pub fn exp(&self) -> &ExpTable {
        &self.exp
    }

    /// Borrow a processor.
    #[must_use]
    pub fn processor(&self, proc_id: usize) -> Option<&Processor> {
        self.processors.get(proc_id)
    }

    fn proc_mut(&mut self, proc_id: i32) -> Result<&mut Processor> {
        usize::try_from(proc_id)
            .ok()
            .and_then(|id| self.processors.get_mut(id))
            .ok_or(DataplaneError::InvalidProcessor {
                proc_id,
                count: MAX_PROCESSORS,
            })
    }

    // ── Control surface ─────────────────────────────────────────────────

    /// Install the pipeline-wide metadata header map. Offsets are relative
    /// to the metadata region.
    pub fn set_metadata(&mut self, headers: Vec<HeaderInfo>) {
        self.metadata = headers;
    }

    /// Size a processor's parser level table.
    ///
    /// # Errors
    ///
    /// Returns an error for an unaddressable processor.
    pub fn init_parser_level(&mut self, proc_id: i32, levels: usize) -> Result<()> {
        self.proc_mut(proc_id)?.parser.init_levels(levels);
        Ok(())
    }

    /// Install or update one parser entry.
    ///
    /// # Errors
    ///
    /// Returns an error for an unaddressable processor or an invalid entry.
    pub fn modify_parser_entry(
        &mut self,
        proc_id: i32,
        level: usize,
        entry: ParserEntry,
    ) -> Result<()> {
        self.proc_mut(proc_id)?.parser.modify_entry(level, entry)
    }

    /// Discard a processor's parser configuration.
    ///
    /// # Errors
    ///
    /// Returns an error for an unaddressable processor.
    pub fn clear_parser(&mut self, proc_id: i32) -> Result<()> {
        self.proc_mut(proc_id)?.parser.clear();
        Ok(())
    }

    /// Append one gateway expression.
    ///
    /// # Errors
    ///
    /// Returns an error for an unaddressable processor.
    pub fn insert_relation_exp(&mut self, proc_id: i32, exp: RelationExp) -> Result<()> {
        self.proc_mut(proc_id)?.gateway.insert_exp(exp);
        Ok(())
    }

    /// Discard a processor's gateway expressions.
    ///
    /// # Errors
    ///
    /// Returns an error for an unaddressable processor.
    pub fn clear_relation_exp(&mut self, proc_id: i32) -> Result<()> {
        self.proc_mut(proc_id)?.gateway.clear_exps();
        Ok(())
    }

    /// Map a gateway bitmap to a verdict.
    ///
    /// # Errors
    ///
    /// Returns an error for an unaddressable processor.
    pub fn mod_res_map(&mut self, proc_id: i32, bitmap: u32, entry: GateEntry) -> Result<()> {
        self.proc_mut(proc_id)?.gateway.mod_res_map(bitmap, entry);
        Ok(())
    }

    /// Discard a processor's gateway bitmap map.
    ///
    /// # Errors
    ///
    /// Returns an error for an unaddressable processor.
    pub fn clear_res_map(&mut self, proc_id: i32) -> Result<()> {
        self.proc_mut(proc_id)?.gateway.clear_res_map();
        Ok(())
    }

    /// Set a processor's default gateway verdict.
    ///
    /// # Errors
    ///
    /// Returns an error for an unaddressable processor.
    pub fn set_default_gate_entry(&mut self, proc_id: i32, entry: GateEntry) -> Result<()> {
        self.proc_mut(proc_id)?.gateway.set_default_entry(entry);
        Ok(())
    }

    /// Wipe and reinstall one matcher's memory, claiming fresh blocks from
    /// the processor's cluster.
    ///
    /// # Errors
    ///
    /// Returns an error for an unaddressable processor or matcher, an
    /// invalid descriptor, or an exhausted cluster. The matcher keeps its
    /// wiped state when the claim fails.
    pub fn set_mem_config(
        &mut self,
        proc_id: i32,
        matcher_id: i32,
        cfg: MemConfig,
    ) -> Result<()> {
        self.clear_old_config(proc_id, matcher_id)?;

        let cluster = Self::cluster_of(proc_id);
        let key_kind = match cfg.match_type {
            MatchType::Exact => BlockKind::Sram,
            MatchType::Ternary | MatchType::Lpm => BlockKind::Tcam,
        };
        let Some(key_claim) = self.pool.claim(cluster, key_kind) else {
            return Err(DataplaneError::config_invalid(format!(
                "cluster {cluster} out of {key_kind:?} blocks"
            )));
        };
        let Some(value_claim) = self.pool.claim(cluster, BlockKind::Sram) else {
            self.pool.release(key_claim);
            return Err(DataplaneError::config_invalid(format!(
                "cluster {cluster} out of Sram blocks"
            )));
        };

        let matcher = self.proc_mut(proc_id)?.matcher_mut(matcher_id)?;
        if let Err(e) = matcher.configure(cfg, vec![key_claim, value_claim]) {
            self.pool.release(key_claim);
            self.pool.release(value_claim);
            return Err(e);
        }
        debug!(proc_id, matcher_id, cluster, "matcher memory configured");
        Ok(())
    }

    /// Install a matcher's key field slices.
    ///
    /// # Errors
    ///
    /// Returns an error for an unaddressable processor or matcher.
    pub fn set_field_info(
        &mut self,
        proc_id: i32,
        matcher_id: i32,
        fields: Vec<crate::types::FieldInfo>,
    ) -> Result<()> {
        self.proc_mut(proc_id)?
            .matcher_mut(matcher_id)?
            .set_field_info(fields);
        Ok(())
    }

    /// Install a matcher's action-to-next-processor map.
    ///
    /// # Errors
    ///
    /// Returns an error for an unaddressable processor or matcher.
    pub fn set_action_proc(
        &mut self,
        proc_id: i32,
        matcher_id: i32,
        map: std::collections::HashMap<i32, i32>,
    ) -> Result<()> {
        self.proc_mut(proc_id)?
            .matcher_mut(matcher_id)?
            .set_action_proc(map);
        Ok(())
    }

    /// Set a matcher's pass-through mode.
    ///
    /// # Errors
    ///
    /// Returns an error for an unaddressable processor or matcher.
    pub fn set_no_table(&mut self, proc_id: i32, matcher_id: i32, no_table: bool) -> Result<()> {
        self.proc_mut(proc_id)?
            .matcher_mut(matcher_id)?
            .set_no_table(no_table);
        Ok(())
    }

    /// Set a matcher's miss action id.
    ///
    /// # Errors
    ///
    /// Returns an error for an unaddressable processor or matcher.
    pub fn set_miss_act_id(&mut self, proc_id: i32, matcher_id: i32, miss_act_id: i32) -> Result<()> {
        self.proc_mut(proc_id)?
            .matcher_mut(matcher_id)?
            .set_miss_act_id(miss_act_id);
        Ok(())
    }

    /// Install one exact entry.
    ///
    /// # Errors
    ///
    /// Returns an error for an unaddressable target or a rejected entry.
    pub fn insert_sram_entry(
        &mut self,
        proc_id: i32,
        matcher_id: i32,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        self.proc_mut(proc_id)?
            .matcher_mut(matcher_id)?
            .insert_sram_entry(key, value)
    }

    /// Install one ternary/LPM entry.
    ///
    /// # Errors
    ///
    /// Returns an error for an unaddressable target or a rejected entry.
    pub fn insert_tcam_entry(
        &mut self,
        proc_id: i32,
        matcher_id: i32,
        key: &[u8],
        mask: &[u8],
        value: &[u8],
    ) -> Result<()> {
        self.proc_mut(proc_id)?
            .matcher_mut(matcher_id)?
            .insert_tcam_entry(key, mask, value)
    }

    /// Wipe one matcher and release its memory blocks.
    ///
    /// # Errors
    ///
    /// Returns an error for an unaddressable processor or matcher.
    pub fn clear_old_config(&mut self, proc_id: i32, matcher_id: i32) -> Result<()> {
        let claims = self
            .proc_mut(proc_id)?
            .matcher_mut(matcher_id)?
            .clear_config();
        for claim in claims {
            self.pool.release(claim);
        }
        Ok(())
    }

    /// Install an action.
    ///
    /// # Errors
    ///
    /// Returns an error for an unaddressable processor or action id.
    pub fn insert_action(&mut self, proc_id: i32, action_id: i32, action: Action) -> Result<()> {
        self.proc_mut(proc_id)?
            .executor
            .insert_action(action_id, action)
    }

    /// Remove one action.
    ///
    /// # Errors
    ///
    /// Returns an error for an unaddressable processor or action id.
    pub fn del_action(&mut self, proc_id: i32, action_id: i32) -> Result<()> {
        self.proc_mut(proc_id)?.executor.del_action(action_id)
    }

    /// Remove a processor's whole action table.
    ///
    /// # Errors
    ///
    /// Returns an error for an unaddressable processor.
    pub fn clear_action(&mut self, proc_id: i32) -> Result<()> {
        self.proc_mut(proc_id)?.executor.clear();
        Ok(())
    }

    // ── Packet path ─────────────────────────────────────────────────────

    /// Process one framed packet.
    ///
    /// Returns the egress frame, or `None` when the packet was dropped.
    ///
    /// # Errors
    ///
    /// Returns [`DataplaneError::FrameTooLarge`] when the frame does not
    /// fit the packet buffer.
    pub fn process(&self, frame: &[u8], ig_if: i32) -> Result<Option<EgressFrame>> {
        let mut phv = Phv::new(frame, ig_if)?;
        for hdr in &self.metadata {
            phv.mark_header(
                hdr.hdr_id,
                (FRONT_HEADER_BYTES * 8) as u16 + hdr.hdr_offset,
                hdr.hdr_len,
            );
        }

        self.processors[0].parser.parse(&mut phv);
        if phv.drop {
            debug!("packet dropped by parser");
            return Ok(None);
        }

        let mut proc_id = 0usize;
        let mut visits = 0usize;
        loop {
            let Some(proc) = self.processors.get(proc_id) else {
                break;
            };
            proc.run(&mut phv, &self.neurons, &self.sigmoid);
            if phv.drop {
                debug!(proc_id, "packet dropped in processor");
                return Ok(None);
            }

            let next = match phv.next_op.entry_type {
                GateEntryType::Stage => phv.next_op.val,
                GateEntryType::Table => phv.next_proc_id,
            };
            if next < 0 || next as usize >= MAX_PROCESSORS {
                break;
            }
            visits += 1;
            if visits >= MAX_VISITS {
                warn!("packet exceeded {MAX_VISITS} processor visits, dropping");
                return Ok(None);
            }
            proc_id = next as usize;
        }

        Ok(Some(EgressFrame {
            bytes: phv.egress_frame(),
            eg_if: phv.eg_if,
        }))
    }

    fn cluster_of(proc_id: i32) -> usize {
        let layout = ClusterLayout::REFERENCE;
        let id = usize::try_from(proc_id).unwrap_or(0);
        layout.cluster_of(id.min(layout.processors - 1)).min(CLUSTERS - 1)
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}
