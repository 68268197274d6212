//! defer-axum: deferred task routes for Axum.
//!
//! A [`DelayedRouteBuilder`] turns an async handler into a route with two
//! endpoints: the submit endpoint enqueues a task, and the execute endpoint
//! (under `/_tasks` by default) runs the handler when the queue calls back.
//! A [`ScheduledRouteBuilder`] does the same for cron jobs.
//!
//! Execute endpoints are guarded by a [`defer_auth::CallbackAuthenticator`]
//! chosen once at startup.

pub mod app;
pub mod callback;
pub mod delayed;
pub mod extract;
pub mod handler;
pub mod scheduled;
mod error;
mod execute;

pub use app::{tasks, TaskApp};
pub use callback::{verify_callback, CallbackGuard};
pub use delayed::{DelayedCall, DelayedRoute, DelayedRouteBuilder, Payload, SubmitAck, SubmitParams};
pub use error::DeferAxumError;
pub use execute::DEFAULT_EXECUTE_PREFIX;
pub use extract::{CloudTasksHeaders, MaxRetries, VerifiedCaller};
pub use handler::TaskHandler;
pub use scheduled::{ScheduledCall, ScheduledRoute, ScheduledRouteBuilder};
