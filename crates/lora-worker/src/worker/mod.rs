pub mod claimer;
pub mod job;
pub mod poller;
pub mod reaper;

pub use claimer::{select_eligible, ClaimedJob, Claimer};
pub use job::JobResult;
pub use poller::{ensure_workspace, open_bucket, IdleLog, WorkerBackends, WorkerLoop};
pub use reaper::{Reaper, TerminalOutcome};
