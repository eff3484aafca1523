//! One match-action processor: parser → gateway → matcher → executor.

use rmt_chip::geometry::MATCHER_SLOTS;
use tracing::debug;

use crate::accel::{NeuronRegistry, SigmoidTable};
use crate::error::{DataplaneError, Result};
use crate::executor::Executor;
use crate::gateway::Gateway;
use crate::matcher::Matcher;
use crate::parser::Parser;
use crate::phv::Phv;
use crate::types::GateEntryType;

/// One processor's configuration and engines.
///
/// The parser only runs for the processor a packet enters the pipeline
/// through; the gateway, matcher bank and executor run on every visit.
#[derive(Debug)]
pub struct Processor {
    id: usize,
    /// Programmable parser.
    pub parser: Parser,
    /// Predicate block selecting the table or next stage.
    pub gateway: Gateway,
    /// Action table.
    pub executor: Executor,
    matchers: Vec<Matcher>,
}

impl Processor {
    /// Unconfigured processor with a full bank of empty matcher slots.
    #[must_use]
    pub fn new(id: usize) -> Self {
        Self {
            id,
            parser: Parser::new(),
            gateway: Gateway::new(),
            executor: Executor::new(),
            matchers: (0..MATCHER_SLOTS).map(|_| Matcher::new()).collect(),
        }
    }

    /// Processor id.
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Borrow a matcher slot.
    ///
    /// # Errors
    ///
    /// Returns [`DataplaneError::InvalidMatcher`] when the slot is out of
    /// range.
    pub fn matcher(&self, matcher_id: i32) -> Result<&Matcher> {
        usize::try_from(matcher_id)
            .ok()
            .and_then(|id| self.matchers.get(id))
            .ok_or(DataplaneError::InvalidMatcher {
                matcher_id,
                count: MATCHER_SLOTS,
            })
    }

    /// Borrow a matcher slot mutably.
    ///
    /// # Errors
    ///
    /// Returns [`DataplaneError::InvalidMatcher`] when the slot is out of
    /// range.
    pub fn matcher_mut(&mut self, matcher_id: i32) -> Result<&mut Matcher> {
        usize::try_from(matcher_id)
            .ok()
            .and_then(|id| self.matchers.get_mut(id))
            .ok_or(DataplaneError::InvalidMatcher {
                matcher_id,
                count: MATCHER_SLOTS,
            })
    }

    /// One match-action pass over a packet.
    ///
    /// The gateway's verdict lands in `next_op`; a `Table` verdict selects
    /// the matcher slot for this visit, a `Stage` verdict overrides the
    /// matcher's next-processor routing after the executor runs. The
    /// fall-through route is the next processor id.
    pub fn run(&self, phv: &mut Phv, neurons: &NeuronRegistry, sigmoid: &SigmoidTable) {
        phv.next_proc_id = (self.id + 1) as i32;

        let verdict = self.gateway.evaluate(phv);
        phv.next_op = verdict;
        if verdict.entry_type == GateEntryType::Table {
            phv.next_matcher_id = verdict.val;
        }

        let slot = usize::try_from(phv.next_matcher_id)
            .ok()
            .filter(|&id| id < MATCHER_SLOTS)
            .unwrap_or_else(|| {
                debug!(
                    matcher_id = phv.next_matcher_id,
                    "matcher id out of range, using slot 0"
                );
                0
            });
        self.matchers[slot].lookup(phv);
        self.executor.execute(phv, neurons, sigmoid);
    }
}
