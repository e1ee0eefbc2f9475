//! Partitioned consumption
//!
//! A router task fans deliveries out by partition to one worker each; the
//! [`ConsumerLifecycle`] starts and stops the whole arrangement.

pub mod lifecycle;
pub mod worker;

pub use lifecycle::{ConsumerLifecycle, LifecycleError};
pub use worker::{route_deliveries, worker_index, PartitionWorker, WorkerExit};
