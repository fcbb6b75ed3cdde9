//! Core scheduling and synchronization for the ORB runtime.
//!
//! This crate provides the execution substrate everything else stands on:
//! deadline-driven execution domains over a cooperative worker pool, sync
//! contexts with deadline-ordered admission, the publish-once waitable
//! reference, the process shutdown state machine, and the system-exception
//! taxonomy.

pub mod config;
pub mod deadline;
pub mod error;
pub mod event;
pub mod exec_domain;
pub mod mem_context;
pub mod scheduler;
pub mod sync;
pub mod waitable;

pub use config::RuntimeConfig;
pub use deadline::{Clock, DeadlineTime, INFINITE_DEADLINE};
pub use error::{
    omg_minor, CompletionStatus, CoreResult, ExceptionKind, RequestException, SystemException,
    UserException,
};
pub use event::EventSync;
pub use exec_domain::{DeadlineGuard, ExecDomain, SecurityContext};
pub use mem_context::MemContext;
pub use scheduler::{
    ActivityGuard, RequestGuard, Scheduler, SchedulerState, SHUTDOWN_FLAG_FORCE,
};
pub use sync::{suspended, synchronized, SyncContext, SyncDomain, SyncFrame};
pub use waitable::{ConstructionGuard, WaitableRef};
