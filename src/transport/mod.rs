//! Delivery transports: one network call per attempt.
//!
//! The engine owns retries, backoff, and the per-attempt timeout. A
//! transport only performs a single delivery and reports what happened.

pub mod gateway;
pub mod smtp;

use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::error::TransportError;

pub use gateway::HttpGateway;
pub use smtp::{SmtpMailer, strip_html};

/// Everything a transport needs for one delivery.
#[derive(Debug)]
pub struct SendRequest<'a> {
    /// Normalized recipient (phone number or email address).
    pub recipient: &'a str,
    /// Rendered subject; email only.
    pub subject: Option<&'a str>,
    /// Rendered body.
    pub body: &'a str,
    pub credential: &'a SecretString,
}

/// What the remote end said about one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub ok: bool,
    pub status_code: Option<u16>,
    pub response: String,
}

impl Delivery {
    pub fn failed(response: impl Into<String>) -> Self {
        Self {
            ok: false,
            status_code: None,
            response: response.into(),
        }
    }
}

/// Outcome of one attempt, as seen by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendAttempt {
    /// 1-based.
    pub index: u32,
    pub ok: bool,
    pub status_code: Option<u16>,
    pub response: String,
}

impl SendAttempt {
    pub fn from_delivery(index: u32, delivery: Delivery) -> Self {
        Self {
            index,
            ok: delivery.ok,
            status_code: delivery.status_code,
            response: delivery.response,
        }
    }
}

/// A single-shot delivery channel.
///
/// `send` must not retry internally. Errors and timeouts are mapped to
/// failed attempts by the engine, never propagated out of a run.
#[async_trait]
pub trait Transport: Send {
    /// Transport name for logging (e.g. "gateway", "smtp").
    fn name(&self) -> &str;

    /// Perform one delivery. `timeout` is the per-attempt budget; the engine
    /// also enforces it from outside.
    async fn send(
        &mut self,
        request: &SendRequest<'_>,
        timeout: Duration,
    ) -> Result<Delivery, TransportError>;

    /// Called after a failed attempt before the next one.
    async fn reset(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Release the session at the end of a run.
    async fn close(&mut self) {}
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn send(
        &mut self,
        request: &SendRequest<'_>,
        timeout: Duration,
    ) -> Result<Delivery, TransportError> {
        (**self).send(request, timeout).await
    }

    async fn reset(&mut self) -> Result<(), TransportError> {
        (**self).reset().await
    }

    async fn close(&mut self) {
        (**self).close().await
    }
}
