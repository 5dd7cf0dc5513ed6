/// Monitoring engine
///
/// This module is responsible for:
/// - Executing probes against monitored endpoints (`checker`, `tls`)
/// - Single-flight execution through store-backed locks (`lock`)
/// - Dispatching due monitors to a bounded worker pool (`scheduler`, `worker`)
pub mod checker;
pub mod lock;
pub mod scheduler;
pub mod tls;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use checker::{Checker, CheckerError, HttpChecker, ProbeRunner};
pub use tls::CertificateInspector;
pub use lock::{ClaimGuard, LockCoordinator};
pub use scheduler::{Cancelled, Scheduler, SchedulerSettings};
pub use worker::{Dispatcher, WorkerPool};
