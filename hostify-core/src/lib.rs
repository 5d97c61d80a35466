//! Core library for hosting workloads as OS services: configuration, config store, workers,
//! the service controller, and install/uninstall lifecycle.

pub mod config;
pub mod controller;
mod error;
pub mod host;
pub mod lifecycle;
pub mod logging;
mod models;
#[cfg(windows)]
pub mod scm;
pub mod store;
pub mod worker;

pub use config::{AccountKind, LoggerConfig, ServiceConfig, WorkerKind};
pub use controller::{ControlHandle, ControlHost, ServiceController, StatusReporter};
pub use error::{Result, ServiceError};
pub use host::{service_main, setup, SetupAction};
pub use lifecycle::{
    HostLayout, LaunchCommand, LifecycleManager, ServiceKind, ServiceRegistrar,
    ServiceRegistration,
};
pub use logging::LoggingGuard;
pub use models::{ControlEvent, ServiceState, ServiceStatus};
pub use store::{ConfigStore, MemoryStore, StoreValue};
pub use worker::Worker;
