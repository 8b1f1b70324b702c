pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::composition::TaskSpec;
pub use application::scheduler::{Scheduler, SubmitOptions, TaskContext, TaskHandler};
pub use domain::entities::{Job, JobId, JobKind, JobPayload, ScanOutcome, TerminalEvent};
pub use domain::state::{JobState, JobTransitionError};
pub use infrastructure::queue::QueueName;
pub use infrastructure::registry::{JobPatch, JobRegistry, RegistryError};
