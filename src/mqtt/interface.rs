// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The trait boundary between the protocol layer and a concrete MQTT v5 client.
//!
//! A working implementation of these traits (connection management, reconnect policy, wire
//! framing) lives outside this crate; only the contract is defined here, mirroring the shape of
//! a managed, reconnect-tolerant pub/sub client.

use std::{fmt, future::Future, pin::Pin};

use super::control_packet::{Publish, PublishProperties, QoS};

/// An error returned by a [`ManagedClient`], [`MqttPubSub`], or [`MqttAck`] operation.
#[derive(Debug)]
pub struct ClientError {
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ClientError {
    /// Constructs a new [`ClientError`] with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Constructs a new [`ClientError`] wrapping an underlying cause.
    #[must_use]
    pub fn with_source(
        message: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(source),
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_deref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// A future resolving once the broker has acknowledged an operation (SUBACK, UNSUBACK, PUBACK).
pub struct CompletionToken(pub Pin<Box<dyn Future<Output = Result<(), ClientError>> + Send>>);

impl Future for CompletionToken {
    type Output = Result<(), ClientError>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        self.0.as_mut().poll(cx)
    }
}

/// A token representing an unacknowledged inbound QoS 1/2 message.
///
/// Dropping the token without calling [`AckToken::ack`] leaves the message unacknowledged; the
/// broker will redeliver it according to its own retry policy.
pub struct AckToken(pub Pin<Box<dyn Future<Output = Result<(), ClientError>> + Send>>);

impl AckToken {
    /// Acknowledges the message, permanently suppressing redelivery.
    pub async fn ack(self) -> Result<(), ClientError> {
        self.0.await
    }
}

/// A stream of inbound PUBLISH packets matching a subscription filter.
pub trait PubReceiver: Send {
    /// Waits for the next message, returning it along with an [`AckToken`] if it was delivered
    /// at QoS 1 or 2. Returns [`None`] once the receiver has been closed and drained.
    fn recv_manual_ack(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Option<(Publish, Option<AckToken>)>> + Send + '_>>;

    /// Stops accepting new messages; already-buffered messages may still be drained via `recv`.
    fn close(&mut self);
}

/// A client that can publish and subscribe, tolerating underlying reconnects transparently.
pub trait ManagedClient {
    /// The concrete [`PubReceiver`] type this client produces.
    type PubReceiver: PubReceiver;

    /// The MQTT client identifier this client is connected (or will connect) as.
    fn client_id(&self) -> &str;

    /// Subscribes to `topic_filter`, returning a receiver scoped to that filter.
    ///
    /// # Errors
    /// Returns [`ClientError`] if the filter is not a syntactically valid MQTT topic filter.
    fn create_filtered_pub_receiver(
        &self,
        topic_filter: &str,
    ) -> Result<Self::PubReceiver, ClientError>;

    /// Subscribes to `topic_filter` at the given QoS.
    fn subscribe(
        &self,
        topic_filter: impl Into<String> + Send,
        qos: QoS,
    ) -> impl Future<Output = Result<CompletionToken, ClientError>> + Send;

    /// Unsubscribes from `topic_filter`.
    fn unsubscribe(
        &self,
        topic_filter: impl Into<String> + Send,
    ) -> impl Future<Output = Result<CompletionToken, ClientError>> + Send;
}

/// A client capable of publishing PUBLISH packets.
pub trait MqttPubSub {
    /// Publishes `payload` to `topic` at the given QoS, with the given properties.
    fn publish(
        &self,
        topic: impl Into<String> + Send,
        qos: QoS,
        retain: bool,
        payload: impl Into<bytes::Bytes> + Send,
        properties: Option<PublishProperties>,
    ) -> impl Future<Output = Result<CompletionToken, ClientError>> + Send;
}

/// A client capable of manually acknowledging inbound QoS 1/2 messages by packet id.
pub trait MqttAck {
    /// Acknowledges the message identified by `pkid`.
    fn ack(&self, pkid: u16) -> impl Future<Output = Result<(), ClientError>> + Send;
}
