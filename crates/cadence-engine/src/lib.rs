// Execution Engine
//
// Stage executors (leaf and nested), the job runner with matrix strategies,
// the trigger-rule DAG scheduler, the workflow driver and the cron-driven
// release scheduler. Everything model-shaped lives in cadence-core; this
// crate only executes.
//
// Key design decisions:
// - One shared CancellationToken per release; fail-fast and triggers use
//   child tokens so they cancel their own subtree only
// - Stage execution returns an explicit StageOutcome instead of using
//   errors for control flow
// - Each job writes its context slot exactly once, through the scheduler

pub mod driver;
pub mod exec;
pub mod outcome;
pub mod release;
pub mod runner;
pub mod runtime;
pub mod scheduler;

pub use driver::Driver;
pub use exec::{evaluate_condition, execute_stage};
pub use outcome::StageOutcome;
pub use release::ReleaseScheduler;
pub use runner::{runner_for, JobRunner, LocalRunner};
pub use runtime::{ExecScope, Runtime};
pub use scheduler::{run_dag, ReplayPlan};
