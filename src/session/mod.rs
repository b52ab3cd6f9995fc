//! # Device Sessions
//!
//! One session per node. The synchronous core ([`DeviceSession`]) owns all
//! per-device state and is driven by explicit inputs; [`SessionDriver`] runs it
//! on a Tokio task against a transport link; [`SessionRegistry`] maps device
//! ids to running sessions and enforces the connection ceiling.
//!
//! ```text
//!  link events ─┐                       ┌─▶ CommandQueue ─▶ Link::write
//!  commands ────┼─▶ SessionDriver ─▶ DeviceSession
//!  timers ──────┘        │              ├─ ChunkReassembler
//!                        ▼              ├─ ReconnectScheduler
//!                 SessionNotice         └─ MetricSeries / ConfigDraft
//! ```

pub mod device;
pub mod draft;
pub mod driver;
pub mod queue;
pub mod reconnect;
pub mod registry;
pub mod series;
pub mod timers;
pub mod transfer;

pub use device::{Applied, DeviceSession, Effect, SessionSettings, SessionSnapshot};
pub use draft::{ConfigDraft, DraftEdit, StatusKind};
pub use driver::{NoticeKind, SessionDriver, SessionHandle, SessionNotice, UserRequest};
pub use queue::CommandQueue;
pub use reconnect::{ReconnectDecision, ReconnectPhase, ReconnectPolicy, ReconnectScheduler};
pub use registry::{ConnectionSlots, SessionRegistry, MAX_CONNECTIONS};
pub use series::{MetricSeries, Profile, Sample};
pub use timers::{TimerKind, Timers};
pub use transfer::{ChunkReassembler, TransferResult, TransferSettings};
