//! CCTV Snapshot Relay
//!
//! Polls a fleet of network cameras for JPEG snapshots and republishes the
//! latest image of each camera to an S3 bucket under a stable key, so
//! downstream consumers never talk to the cameras directly.
//!
//! ## Features
//!
//! - **Fallback publishing**: a placeholder image replaces the snapshot of a
//!   camera that stopped answering, written once until the camera recovers
//! - **Failure accounting**: repeated failures disable a device, and a client
//!   error (bad credentials, wrong path) disables it at once
//! - **Two topologies**: one task per camera, or a bounded worker pool
//!   serving cameras round-robin
//! - **Model-aware endpoints**: snapshot URL and authentication chosen per
//!   camera model, including HTTP digest
//!
//! ## Architecture
//!
//! ```text
//!  Roster (file / HTTP)
//!        │
//!        ▼
//! ┌──────────────┐   fetch    ┌──────────────┐
//! │ Cycle        │──────────▶│ HTTP         │◀──── cameras
//! │ Runner       │◀──────────│ Fetcher      │
//! └──────────────┘  outcome   └──────────────┘
//!        │
//!        │ device state
//!        ▼
//! ┌──────────────┐           ┌──────────────┐
//! │ Publisher    │──────────▶│ S3 bucket    │
//! │              │  {id}.jpg │              │
//! └──────────────┘           └──────────────┘
//! ```

pub mod config;
pub mod device;
pub mod digest;
pub mod fetcher;
pub mod publisher;
pub mod roster;
pub mod scheduler;

pub use config::Config;
pub use device::{Device, FailureKind, ModelClass};
pub use fetcher::{FetchError, HttpFetcher, ImageFetcher};
pub use publisher::{ObjectStore, PublishOutcome, Publisher, S3Store};
pub use roster::{build_devices, RosterSource};
pub use scheduler::{CycleRunner, CycleSettings, RunSummary, Strategy};
