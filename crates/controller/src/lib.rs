//! rekon controller: informer (reflector + cache + dispatch) and the reconcile loop.

#![forbid(unsafe_code)]

pub mod config;
mod controller;
mod informer;
mod reflector;

pub use config::{ControllerConfig, InformerConfig};
pub use controller::{rate_limiter_for, Controller, ControllerError, ReconcileError, Reconciler};
pub use informer::{EventHandler, HandlerError, Informer};

pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
