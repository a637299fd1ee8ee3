//! The seam between the relay and whatever message bus carries it.
//!
//! The relay needs very little from a bus:
//! - at-least-once delivery (ordering is *not* assumed),
//! - an opaque byte payload plus string headers on every message,
//! - a way to acknowledge a message, and a way to leave it unacknowledged so
//!   it is delivered again later.
//!
//! [`Publisher`], [`Subscriber`] and [`Delivery`] capture exactly that. A real
//! broker client implements them; [`memory::MemoryBus`] is an in-process bus
//! used by the tests and the demo.

pub mod memory;

use crate::fragment::Headers;
use thiserror::Error;

pub use memory::{MemoryBus, MemoryBusOptions, MemorySubscriber};

/// Transport-level failures. Unlike per-fragment errors these may end a
/// consumer loop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The connection to the broker is gone.
    #[error("bus disconnected: {0}")]
    Disconnected(String),

    /// A publish was rejected.
    #[error("publish failed: {0}")]
    PublishFailed(String),

    /// Fetching the next batch failed.
    #[error("fetch failed: {0}")]
    FetchFailed(String),

    /// Acknowledging a message failed.
    #[error("ack failed: {0}")]
    AckFailed(String),

    /// The handle was closed by its owner.
    #[error("bus handle closed")]
    Closed,
}

impl BusError {
    /// Whether a consumer loop should stop on this error.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected(_) | Self::Closed)
    }
}

/// A message ready to be published.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Idempotency key; see [`crate::fragment::message_key`].
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
}

/// Producer side of a bus.
pub trait Publisher: Send + Sync {
    /// Publish one message. Returns once the bus has accepted it.
    ///
    /// # Errors
    ///
    /// Returns a [`BusError`] if the bus rejects the message.
    fn publish(&self, message: OutboundMessage) -> Result<(), BusError>;

    /// Release the producer handle. Publishing afterwards fails.
    ///
    /// # Errors
    ///
    /// Returns a [`BusError`] if the handle cannot be released cleanly.
    fn close(&self) -> Result<(), BusError> {
        Ok(())
    }
}

/// One delivered message.
///
/// Dropping a delivery without calling [`Delivery::ack`] leaves it
/// unacknowledged; the bus will deliver it again.
pub trait Delivery: Send {
    fn payload(&self) -> &[u8];

    fn headers(&self) -> &Headers;

    /// Acknowledge the message so it is not delivered again.
    ///
    /// # Errors
    ///
    /// Returns a [`BusError`] if the bus could not record the ack.
    fn ack(&self) -> Result<(), BusError>;
}

/// Consumer side of a bus.
pub trait Subscriber: Send {
    /// Fetch up to `max` messages. An empty batch means nothing is available
    /// right now.
    ///
    /// # Errors
    ///
    /// Returns a [`BusError`] on transport failure.
    fn fetch(&mut self, max: usize) -> Result<Vec<Box<dyn Delivery>>, BusError>;

    /// Release the consumer handle.
    ///
    /// # Errors
    ///
    /// Returns a [`BusError`] if the handle cannot be released cleanly.
    fn close(&mut self) -> Result<(), BusError>;
}

impl<P: Publisher + ?Sized> Publisher for &P {
    fn publish(&self, message: OutboundMessage) -> Result<(), BusError> {
        (**self).publish(message)
    }

    fn close(&self) -> Result<(), BusError> {
        (**self).close()
    }
}

/// Closes the wrapped publisher when dropped, whatever the exit path.
pub struct PublisherGuard<P: Publisher> {
    inner: P,
}

impl<P: Publisher> PublisherGuard<P> {
    pub const fn new(inner: P) -> Self {
        Self { inner }
    }

    pub const fn get(&self) -> &P {
        &self.inner
    }
}

impl<P: Publisher> Drop for PublisherGuard<P> {
    fn drop(&mut self) {
        if let Err(e) = self.inner.close() {
            tracing::warn!(error = %e, "closing publisher failed");
        }
    }
}

/// Closes the wrapped subscriber when dropped, whatever the exit path.
pub struct SubscriberGuard<'a, S: Subscriber + ?Sized> {
    inner: &'a mut S,
}

impl<'a, S: Subscriber + ?Sized> SubscriberGuard<'a, S> {
    pub fn new(inner: &'a mut S) -> Self {
        Self { inner }
    }

    /// Fetch through the guarded subscriber.
    ///
    /// # Errors
    ///
    /// See [`Subscriber::fetch`].
    pub fn fetch(&mut self, max: usize) -> Result<Vec<Box<dyn Delivery>>, BusError> {
        self.inner.fetch(max)
    }
}

impl<S: Subscriber + ?Sized> Drop for SubscriberGuard<'_, S> {
    fn drop(&mut self) {
        if let Err(e) = self.inner.close() {
            tracing::warn!(error = %e, "closing subscriber failed");
        }
    }
}
