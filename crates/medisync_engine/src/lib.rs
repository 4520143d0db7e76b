//! # MediSync Engine
//!
//! The replication engine of the MediSync client: trigger-driven
//! incremental pull, queued push, and the coordination between them.
//!
//! An offline-first client keeps a local copy of the clinical records it
//! needs and reconciles it with the upstream whenever an opportunity
//! arises. The engine is built from a few collaborating parts:
//!
//! - [`PullEngine`] fetches changed records page by page with adaptive
//!   page sizing, enqueues each page durably, and only then advances the
//!   per-resource checkpoint. Interrupted pulls resume at the page
//!   boundary they reached.
//! - [`PushEngine`] drains locally queued changes to the upstream in
//!   priority order, resolving divergence through a [`ConflictPolicy`]
//!   and removing entries only on confirmed delivery.
//! - [`TriggerCoordinator`] serializes passes: startup, connectivity
//!   return, periodic polling, and manual requests all funnel into one
//!   pass at a time, with concurrent triggers dropped rather than queued.
//! - [`SinkRegistry`] dispatches drained inbound batches to typed
//!   persistence handlers registered at configuration time.
//!
//! All durable state lives in `medisync_store` and every access to it
//! goes through the `medisync_pool` connection pool, so engine threads
//! and application threads share one readers-or-writer discipline.
//!
//! The upstream is abstracted behind [`UpstreamQuery`], [`UpstreamSubmit`]
//! and [`AvailabilityProbe`]; no wire protocol is assumed.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod datastore;
mod error;
mod notify;
mod paging;
mod pull;
mod push;
mod registry;
mod transport;
mod trigger;

pub use config::{
    EngineConfig, PageLadder, PageRung, ResourceSubscription, TriggerKind, TriggerMask,
};
pub use datastore::{DatastoreFactory, LocalDatastore};
pub use error::{EngineError, EngineResult};
pub use notify::{NotificationSink, Notifier, NullSink};
pub use paging::PageSizer;
pub use pull::PullEngine;
pub use push::{ConflictPolicy, PushEngine, PushReport, PushWaiter};
pub use registry::SinkRegistry;
pub use transport::{
    AvailabilityProbe, EndpointClass, MockUpstream, PatchOp, QueryPage, SubmitOutcome,
    UpstreamQuery, UpstreamSubmit,
};
pub use trigger::{PassSummary, TriggerCoordinator};
