//! User-defined task scheduling for the control plane.
//!
//! [`CronService`] persists tasks (`at` / `every` / `cron` schedules), runs
//! one scheduler loop, and records run history. Concrete actions live in
//! [`executor::ControlTaskExecutor`]; the service only sees the
//! [`executor::TaskExecutor`] trait, which is what the tests fake.

#![forbid(unsafe_code)]

pub mod executor;
pub mod schedule;
pub mod service;

pub use executor::{
    ControlTaskExecutor, TaskExecution, TaskExecutor, WebhookError, validate_webhook_request,
};
pub use schedule::{CronExpr, ScheduleError, is_due, validate_schedule};
pub use service::{CronError, CronService, NewTask, TASK_HISTORY_CAP, TaskSetSnapshot};
