//! Domain types shared by the store, the scheduler and the checkers.

pub mod monitor;
pub mod result;

pub use monitor::{CheckKind, HttpMonitor, Monitor, MonitorKind, UnknownKind, clamp_request_timeout};
pub use result::{CheckResult, HttpDetail, Outcome, ProbeDetail, SslDetails};
