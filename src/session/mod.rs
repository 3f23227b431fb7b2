//! Session lifecycle
//!
//! One tunnel session per host: the persisted status record, the registry
//! that guards it, and the controller that starts and stops sessions.

mod controller;
mod registry;
mod status;

pub use controller::{
    local_host_address, HostEnvironment, PasswordSource, RestartPlan, SessionContext, SessionController,
    SessionPhase, StopOutcome, STOP_TIMEOUT,
};
pub use registry::{ProcessControl, ProcessLiveness, SessionRegistry, SystemProcesses};
pub use status::{Role, SessionStatus};
