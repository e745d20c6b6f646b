//! Den - Alopex Ring-Buffered Time Series Store
//!
//! This crate stores timestamped multi-channel frames in ring-buffer
//! partitions: a bounded in-memory cache backed by an optional bounded
//! on-disk archive that survives restarts and recovers from partial writes.
//!
//! # Components
//!
//! - [`PartitionRouter`]: Routes frames to partitions and answers traversals
//! - [`RingBufferPartition`]: One cache tier plus an optional archive tier
//! - [`Registration`]: Per-channel time extent, sample count and metadata
//! - [`Door`]: Named reader/writer gate with termination
//!
//! # Layout
//!
//! ```text
//! <root>/
//! ├── summary.den  reghdr.den  regdat.den  seal.den   router registration
//! ├── RB1/
//! │   ├── summary.den  reghdr.den  regdat.den  seal.den
//! │   ├── FS1/  frames.den  seal.den                  sealed chunk-group
//! │   ├── FS2/  frames.den                            open chunk-group
//! │   └── NOTRECOVERED/  UNRECOVERABLE/
//! └── RB2/ ...
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_den::{ArchiveMode, ChannelSample, Frame, PartitionRouter, Request, RouterConfig, TierLimits};
//!
//! let router = PartitionRouter::open(
//!     RouterConfig::default()
//!         .with_archive_root("/var/lib/den", ArchiveMode::Append)
//!         .with_cache(TierLimits::frames(1000))
//!         .with_archive(TierLimits::frames(100_000)),
//! )?;
//!
//! let index = router.accept_frame(Frame::new(vec![
//!     ChannelSample::float64("plant/boiler/temp", 12.5, 81.0),
//! ]))?;
//!
//! let (result, reason) = router.traverse(&Request::all("plant/..."))?;
//! router.close()?;
//! ```

#![deny(missing_docs)]

pub mod config;
pub mod door;
pub mod error;
pub mod frame;
pub mod partition;
pub mod query;
pub mod registration;
pub mod router;
pub mod signal;
pub mod storage;
pub mod tier;

pub use config::{ArchiveMode, RouterConfig, TierLimits};
pub use door::Door;
pub use error::{DenError, Result};
pub use frame::{ChannelSample, Frame, PayloadKind, StoredFrame, TimeRange};
pub use partition::{PartitionState, PartitionStats, RingBufferPartition};
pub use query::{MatchReason, QueryResult, Request, SampleHit, TimeSelector};
pub use registration::{ChannelRegistration, NamePattern, Registration, RegistrationUpdate};
pub use router::{DeleteOutcome, DeleteReport, PartitionRouter, RouterStats};
