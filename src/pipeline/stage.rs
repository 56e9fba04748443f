//! Lead stage machine.
//!
//! Stages are integers `0..=terminal + 1`:
//! - below `terminal`: open, the model's proposed stage is taken as-is
//! - at `terminal`: proposal due, generated once per lead before the model call
//! - above `terminal`: closed to automation, turns are no-ops
//!
//! Stages only move forward here. Going back is an explicit store reset.

use tracing::debug;

use crate::config::EngineConfig;
use crate::lead::{Lead, Stage};

/// How a turn treats a lead at a given stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagePhase {
    /// Regular conversation turn.
    Open,
    /// Terminal stage: proposal generation fires (once) before the model call.
    ProposalDue,
    /// Handed off; no model call and no lead mutation.
    Closed,
}

/// Transition rules over lead stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageMachine {
    qualified_threshold: Stage,
    terminal_stage: Stage,
}

impl StageMachine {
    pub fn new(qualified_threshold: Stage, terminal_stage: Stage) -> Self {
        Self {
            qualified_threshold,
            terminal_stage,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.qualified_threshold, config.terminal_stage)
    }

    pub fn qualified_threshold(&self) -> Stage {
        self.qualified_threshold
    }

    pub fn terminal_stage(&self) -> Stage {
        self.terminal_stage
    }

    /// First stage past the terminal one; automation stops here.
    pub fn closed_stage(&self) -> Stage {
        Stage(self.terminal_stage.value() + 1)
    }

    pub fn phase(&self, current: Stage) -> StagePhase {
        match current.cmp(&self.terminal_stage) {
            std::cmp::Ordering::Less => StagePhase::Open,
            std::cmp::Ordering::Equal => StagePhase::ProposalDue,
            std::cmp::Ordering::Greater => StagePhase::Closed,
        }
    }

    /// Whether this turn must run proposal generation for the lead.
    pub fn proposal_due(&self, lead: &Lead) -> bool {
        match self.phase(lead.stage) {
            StagePhase::ProposalDue => !lead.proposal_sent,
            StagePhase::Open | StagePhase::Closed => false,
        }
    }

    /// Resolve the stage after a turn.
    ///
    /// `proposed` is the contract's stage (`None` when absent or invalid).
    /// Lower proposals are ignored; proposals past the closed stage are
    /// clamped to it.
    pub fn next(&self, current: Stage, proposed: Option<Stage>) -> Stage {
        match self.phase(current) {
            StagePhase::Closed => current,
            StagePhase::Open | StagePhase::ProposalDue => match proposed {
                None => current,
                Some(p) if p < current => {
                    debug!(current = %current, proposed = %p, "Ignoring backwards stage");
                    current
                }
                Some(p) => p.min(self.closed_stage()),
            },
        }
    }

    /// Edge: `previous` was below the qualified threshold and `next` is at or
    /// above it.
    pub fn crossed_qualified(&self, previous: Stage, next: Stage) -> bool {
        previous < self.qualified_threshold && next >= self.qualified_threshold
    }
}

impl Default for StageMachine {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}
