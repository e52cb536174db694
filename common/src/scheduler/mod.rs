// Scheduler module: dispatch queue, misfire policy and the scheduler loop

pub mod clock;
pub mod engine;
pub mod misfire;
pub mod queue;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{DispatchSummary, LoopState, Scheduler};
pub use misfire::{plan_fires, FireAction, FirePlan, MAX_BACKLOG_FIRES};
pub use queue::DispatchQueue;
