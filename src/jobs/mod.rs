pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod models;
pub mod queue;
pub mod reaper;
pub mod registry;
pub mod retry;
pub mod timeout;
pub mod types;

pub use dispatcher::{Dispatcher, DispatcherConfig, InFlightJobs};
pub use error::JobError;
pub use handlers::{WebhookHandler, webhook_registry};
pub use models::{
    DEFAULT_PRIORITY, DeadLetterEntry, Job, JobPatch, JobStats, MAX_PRIORITY, MIN_PRIORITY, NewJob,
};
pub use queue::{CancelOutcome, JobQueue};
pub use reaper::{ReaperSchedule, StaleJobReaper};
pub use registry::HandlerRegistry;
pub use retry::{Disposition, RetryPolicy};
pub use timeout::{JobTimeouts, with_timeout};
pub use types::{JobContext, JobHandler, JobStatus, JobType, Provider};
