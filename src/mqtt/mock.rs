// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An in-memory [`ManagedClient`] used by this crate's own tests. Not part of the public API.

use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
};

use tokio::sync::mpsc;

use super::{
    control_packet::{Publish, PublishProperties, QoS},
    interface::{AckToken, ClientError, CompletionToken, ManagedClient, MqttPubSub, PubReceiver},
};

/// A record of a call made against [`MockClient`].
#[derive(Debug, Clone)]
pub enum RecordedCall {
    /// A `subscribe` call for the given topic filter.
    Subscribe(String),
    /// An `unsubscribe` call for the given topic filter.
    Unsubscribe(String),
    /// A `publish` call for the given topic and payload.
    Publish(String, bytes::Bytes, Option<PublishProperties>),
}

/// A hand-rolled stand-in for a live MQTT client, used to drive the cache/executor/invoker/
/// telemetry state machines in tests without a broker.
#[derive(Clone)]
pub struct MockClient {
    client_id: String,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
    inbound: Arc<Mutex<Option<mpsc::UnboundedReceiver<Publish>>>>,
    inbound_tx: mpsc::UnboundedSender<Publish>,
}

impl MockClient {
    /// Constructs a new mock client with the given client id.
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            client_id: client_id.into(),
            calls: Arc::new(Mutex::new(Vec::new())),
            inbound: Arc::new(Mutex::new(Some(rx))),
            inbound_tx: tx,
        }
    }

    /// Pushes a [`Publish`] that a subsequent `recv_manual_ack` call will surface.
    pub fn push_inbound(&self, publish: Publish) {
        let _ = self.inbound_tx.send(publish);
    }

    /// Returns every call recorded so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl ManagedClient for MockClient {
    type PubReceiver = MockPubReceiver;

    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn create_filtered_pub_receiver(
        &self,
        _topic_filter: &str,
    ) -> Result<Self::PubReceiver, ClientError> {
        let rx = self
            .inbound
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| ClientError::new("mock receiver already taken"))?;
        Ok(MockPubReceiver {
            rx,
            closed: false,
        })
    }

    fn subscribe(
        &self,
        topic_filter: impl Into<String> + Send,
        _qos: QoS,
    ) -> impl Future<Output = Result<CompletionToken, ClientError>> + Send {
        let calls = self.calls.clone();
        let topic_filter = topic_filter.into();
        async move {
            calls.lock().unwrap().push(RecordedCall::Subscribe(topic_filter));
            Ok(CompletionToken(Box::pin(async { Ok(()) })))
        }
    }

    fn unsubscribe(
        &self,
        topic_filter: impl Into<String> + Send,
    ) -> impl Future<Output = Result<CompletionToken, ClientError>> + Send {
        let calls = self.calls.clone();
        let topic_filter = topic_filter.into();
        async move {
            calls.lock().unwrap().push(RecordedCall::Unsubscribe(topic_filter));
            Ok(CompletionToken(Box::pin(async { Ok(()) })))
        }
    }
}

impl MqttPubSub for MockClient {
    fn publish(
        &self,
        topic: impl Into<String> + Send,
        _qos: QoS,
        _retain: bool,
        payload: impl Into<bytes::Bytes> + Send,
        properties: Option<PublishProperties>,
    ) -> impl Future<Output = Result<CompletionToken, ClientError>> + Send {
        let calls = self.calls.clone();
        let topic = topic.into();
        let payload = payload.into();
        async move {
            calls
                .lock()
                .unwrap()
                .push(RecordedCall::Publish(topic, payload, properties));
            Ok(CompletionToken(Box::pin(async { Ok(()) })))
        }
    }
}

/// The [`PubReceiver`] produced by [`MockClient`].
pub struct MockPubReceiver {
    rx: mpsc::UnboundedReceiver<Publish>,
    closed: bool,
}

impl PubReceiver for MockPubReceiver {
    fn recv_manual_ack(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Option<(Publish, Option<AckToken>)>> + Send + '_>> {
        Box::pin(async move {
            if self.closed {
                return None;
            }
            self.rx.recv().await.map(|publish| {
                let qos = publish.qos;
                let ack_token = if qos == QoS::AtMostOnce {
                    None
                } else {
                    Some(AckToken(Box::pin(async { Ok(()) })))
                };
                (publish, ack_token)
            })
        })
    }

    fn close(&mut self) {
        self.closed = true;
        self.rx.close();
    }
}
