//! Application layer: leases, the producer/worker runtime and operator
//! commands, built on the ports.

pub mod admin;
pub mod coordinator;
pub mod producer;
pub mod retry;
pub mod runtime;
pub mod worker_pool;

pub use self::admin::{Admin, AdminError, ImportReport, SubjectImport};
pub use self::coordinator::LeaseCoordinator;
pub use self::producer::{Dispatch, Producer, ProducerReport};
pub use self::retry::RetryPolicy;
pub use self::runtime::{DEFAULT_IDLE_INTERVAL, RunReport, Runtime, RuntimeSettings};
pub use self::worker_pool::{SharedReceiver, StartupError, WorkerDeps, WorkerPool, WorkerReport};
