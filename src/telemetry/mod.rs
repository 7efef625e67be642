// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Fire-and-forget telemetry: a sender publishes, any number of receivers subscribe.

use crate::common::protocol_version::ProtocolVersion;

pub mod receiver;
pub mod sender;

pub use receiver::Receiver;
pub use sender::Sender;

/// Protocol version used by all telemetry senders and receivers in this crate.
pub(crate) const TELEMETRY_PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };
/// Assumed version if an inbound message carries none.
pub(crate) const DEFAULT_TELEMETRY_PROTOCOL_VERSION: ProtocolVersion =
    ProtocolVersion { major: 1, minor: 0 };

/// Default `CloudEvent` event type for AIO telemetry.
pub const DEFAULT_TELEMETRY_CLOUD_EVENT_EVENT_TYPE: &str = "ms.aio.telemetry";
