//! Transport boundary.
//!
//! The engine does not know how bytes reach a node. It consumes a
//! [`Transport`] that can open a [`Link`], writes requests through the link,
//! and receives notifications through the [`NotificationSink`] it hands to
//! [`Link::subscribe`].
//!
//! Every link a session opens gets a fresh generation number. The sink tags
//! each event with it, so events from a link that has since been replaced are
//! recognised and ignored by the session.

pub mod mock;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::LinkError;

pub use mock::{MockLink, MockTransport};

/// Inbound event delivered by a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Notification(Vec<u8>),
    Disconnected,
}

/// Callback handed to a link on subscribe.
#[derive(Debug, Clone)]
pub struct NotificationSink {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, LinkEvent)>,
}

impl NotificationSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, LinkEvent)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Deliver a notification. Returns false once the session is gone.
    pub fn notify(&self, bytes: Vec<u8>) -> bool {
        self.tx
            .send((self.generation, LinkEvent::Notification(bytes)))
            .is_ok()
    }

    /// Report an unexpected link loss.
    pub fn disconnected(&self) -> bool {
        self.tx
            .send((self.generation, LinkEvent::Disconnected))
            .is_ok()
    }
}

/// One live connection to a node.
#[async_trait]
pub trait Link: Send + Sync {
    async fn write(&self, bytes: Vec<u8>) -> Result<(), LinkError>;

    /// Install the inbound callback. Called once per link.
    fn subscribe(&self, sink: NotificationSink);

    async fn disconnect(&self);
}

/// Factory for links to one node.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Link>, LinkError>;
}
