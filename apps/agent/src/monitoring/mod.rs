/// Monitoring engine module - handles execution of checks
///
/// This module is responsible for:
/// - Running service, web and SNMP checks
/// - Confirming failures before they are reported
/// - Queueing checks and tracking the ones in flight
/// - Gating dispatch rounds on network health
pub mod checker;
pub mod executor;
pub mod health;
pub mod ping;
pub mod queue;
pub mod types;
pub mod validation;

pub use checker::{Checker, ProbeError, StandardChecker};
pub use executor::MonitoringExecutor;
pub use health::{HealthCheckError, HealthGate};
pub use queue::{CheckQueue, InProgressChecks, InProgressGuard};
pub use types::{Check, CheckResult, Input};
