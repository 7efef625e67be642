// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! MQTT v5 wire types consumed by the protocol layer.
//!
//! This module defines only the subset of the MQTT v5 PUBLISH packet shape that the RPC and
//! telemetry components actually read or write. A concrete broker transport is outside this
//! crate's scope; these types are the contract a transport implementation must produce/accept.

use bytes::Bytes;

/// MQTT v5 quality of service level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    /// At most once delivery.
    AtMostOnce,
    /// At least once delivery. The only level used by this crate's RPC and telemetry flows.
    AtLeastOnce,
    /// Exactly once delivery.
    ExactlyOnce,
}

/// MQTT v5 PUBLISH properties relevant to the protocol layer.
#[derive(Debug, Clone, Default)]
pub struct PublishProperties {
    /// Correlation data used to match a response to its originating request.
    pub correlation_data: Option<Bytes>,
    /// Topic the receiver should publish a response to.
    pub response_topic: Option<String>,
    /// MIME content type of the payload.
    pub content_type: Option<String>,
    /// `0` for unspecified bytes, `1` for UTF-8 text, per the MQTT v5 spec.
    pub payload_format_indicator: u8,
    /// Seconds after which the broker may discard an undelivered message.
    pub message_expiry_interval: Option<u32>,
    /// Application-defined key/value pairs, order-preserving and allowing duplicate keys.
    pub user_properties: Vec<(String, String)>,
}

/// An inbound or outbound MQTT v5 PUBLISH packet.
#[derive(Debug, Clone)]
pub struct Publish {
    /// The topic the message was (or will be) published to, as raw bytes.
    pub topic: Bytes,
    /// The message payload.
    pub payload: Bytes,
    /// Quality of service the message was delivered/will be sent at.
    pub qos: QoS,
    /// Whether the broker should retain this message for future subscribers.
    pub retain: bool,
    /// The broker-assigned packet identifier, present for QoS 1/2 deliveries.
    pub pkid: u16,
    /// MQTT v5 PUBLISH properties, if any were set.
    pub properties: Option<PublishProperties>,
}
