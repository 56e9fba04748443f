//! Conversation orchestration engine.
//!
//! Every inbound event flows through:
//! 1. `ConcurrencyGate::try_enter()`: one turn per contact, extra events dropped
//! 2. `StageMachine` pre-check: closed leads stop here
//! 3. proposal generation at the terminal stage
//! 4. the language model, decoded by `contract::parse()`
//! 5. `DispatchScheduler::deliver()`: paced segments
//! 6. lead upsert, then `NotificationRules::evaluate()`

pub mod contract;
pub mod dispatch;
pub mod gate;
pub mod orchestrator;
pub mod prompts;
pub mod proposal;
pub mod rules;
pub mod stage;

pub use orchestrator::{Orchestrator, OrchestratorDeps, TurnOutcome, TurnReport};
