pub mod inflight;
pub mod poller;
pub mod progress;
pub mod submitter;
pub mod types;

pub use inflight::{InFlightGuard, InFlightRegistry};
pub use poller::{AdaptivePoller, PollOutcome, PollSnapshot, PollState, PollerHandle, PollerSettings};
pub use progress::{Timeline, WorkerEvent, WorkerState};
pub use submitter::JobSubmitter;
pub use types::{JobHandle, JobRequest, JobState, JobStatus};
