//! # Node Wire Protocol
//!
//! Everything needed to turn raw notifications into typed messages and typed
//! requests back into bytes.
//!
//! ```text
//!  notification bytes
//!         │ decode_notification
//!         ▼
//!  ┌───────────────┐
//!  │ MessageFramer │  one notification → N text messages
//!  └───────────────┘
//!         │
//!  ┌───────────────┐
//!  │ PayloadParser │  JSON or key=value → ParsedMessage
//!  └───────────────┘
//! ```
//!
//! Outbound requests are modelled by [`outbound::Action`].

pub mod framer;
pub mod keys;
pub mod message;
pub mod outbound;
pub mod parser;

pub use framer::{decode_notification, MessageFramer};
pub use keys::KeyPolicy;
pub use message::{
    ConfigDelta, FlashStatus, Fragment, FragmentMode, ParsedMessage, PinRole, ProfileUpdate,
};
pub use outbound::{Action, ActionKind};
pub use parser::PayloadParser;
