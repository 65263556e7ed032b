//! Core of the modelgate inference gateway.
//!
//! The crate ties four capabilities together:
//!
//! - [`queue`]: a durable work queue with lease-based delivery,
//! - [`record`]: the external task-record store callers observe,
//! - [`backend`]: adapters over heterogeneous inference platforms,
//! - [`metrics`]: an injected sink for everything observable.
//!
//! On top of these, [`distributor`] owns admission and queue mutation,
//! [`gateway`] drives the request-facing flows, [`processor`] runs the
//! claim-execute-commit workers, and [`reconcile`]
//! folds queue/record divergences back into the record store.  The host
//! binary wires them together and exposes the HTTP surface.

pub mod backend;
pub mod config;
pub mod distributor;
pub mod gateway;
pub mod metrics;
pub mod processor;
pub mod queue;
pub mod reconcile;
pub mod record;
pub mod task;

pub use backend::{build_backend, Backend, BackendError};
pub use config::{Config, Platform};
pub use distributor::TaskDistributor;
pub use gateway::{Gateway, GatewayError};
pub use metrics::{LogSink, MetricsSink, RecordingSink};
pub use processor::TaskProcessor;
pub use queue::{InMemoryQueue, RedisTaskQueue, TaskQueue, QUEUE_CRITICAL};
pub use reconcile::ReconcileEngine;
pub use record::{HttpRecordStore, MemoryRecordStore, RecordError, RecordStore};
pub use task::{
    DocsRequest, InferRequest, InferResponse, PredictionPayload, TaskInfo, TaskStatus, TaskUpdate,
};
