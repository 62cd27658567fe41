mod instance;
mod job;
mod task;
mod workflow;

pub use instance::{InstanceAttach, SchedInstance};
pub use job::SchedJob;
pub use task::{derive_run_state, SchedTask};
pub use workflow::{SchedDepend, SchedWorkflow};
