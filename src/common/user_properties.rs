// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Reserved MQTT user property keys used by the protocol layer, and validation for
//! application-supplied custom user data.

use std::{fmt, str::FromStr};

use crate::common::aio_protocol_error::{AIOProtocolError, Value};

/// Partition key user property, used by the broker for load distribution. Passed through
/// unmodified; not interpreted by this crate.
pub const PARTITION_KEY: &str = "partitionKey";

/// Reserved MQTT user property keys exchanged between invokers, executors, and telemetry
/// senders/receivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserProperty {
    /// The sending component's Hybrid Logical Clock timestamp.
    Timestamp,
    /// The major.minor protocol version the sender implements.
    ProtocolVersion,
    /// The sending component's MQTT client identifier.
    SourceId,
    /// The protocol major versions the sender will accept in a response, RPC only.
    SupportedMajorVersions,
    /// The request's protocol major version, carried on an error response, RPC only.
    RequestProtocolVersion,
    /// The status code of a command response, RPC only.
    Status,
    /// A human-readable status message accompanying a non-success status, RPC only.
    StatusMessage,
    /// `"true"` if a non-success status originated in application/handler code, RPC only.
    IsApplicationError,
    /// The name of the property that failed validation, carried on an error response, RPC only.
    InvalidPropertyName,
    /// The value of the property that failed validation, carried on an error response, RPC only.
    InvalidPropertyValue,
    /// An application-defined error code, RPC only.
    AppErrCode,
    /// An application-defined error payload, RPC only.
    AppErrPayload,
    /// A fencing token used to order writes against a shared resource, RPC only.
    FencingToken,
}

impl fmt::Display for UserProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UserProperty::Timestamp => "__ts",
            UserProperty::ProtocolVersion => "__protVer",
            UserProperty::SourceId => "__srcId",
            UserProperty::SupportedMajorVersions => "__supProtMajorVer",
            UserProperty::RequestProtocolVersion => "__requestProtVer",
            UserProperty::Status => "__stat",
            UserProperty::StatusMessage => "__stMsg",
            UserProperty::IsApplicationError => "__apErr",
            UserProperty::InvalidPropertyName => "__propName",
            UserProperty::InvalidPropertyValue => "__propVal",
            UserProperty::AppErrCode => "__apErrCode",
            UserProperty::AppErrPayload => "__apErrPayload",
            UserProperty::FencingToken => "__ftok",
        };
        write!(f, "{s}")
    }
}

impl FromStr for UserProperty {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "__ts" => Ok(UserProperty::Timestamp),
            "__protVer" => Ok(UserProperty::ProtocolVersion),
            "__srcId" => Ok(UserProperty::SourceId),
            "__supProtMajorVer" => Ok(UserProperty::SupportedMajorVersions),
            "__requestProtVer" => Ok(UserProperty::RequestProtocolVersion),
            "__stat" => Ok(UserProperty::Status),
            "__stMsg" => Ok(UserProperty::StatusMessage),
            "__apErr" => Ok(UserProperty::IsApplicationError),
            "__propName" => Ok(UserProperty::InvalidPropertyName),
            "__propVal" => Ok(UserProperty::InvalidPropertyValue),
            "__apErrCode" => Ok(UserProperty::AppErrCode),
            "__apErrPayload" => Ok(UserProperty::AppErrPayload),
            "__ftok" => Ok(UserProperty::FencingToken),
            _ => Err(()),
        }
    }
}

/// Returns `true` if `key` is reserved for protocol use and must not appear in
/// application-supplied custom user data.
#[must_use]
pub fn is_reserved(key: &str) -> bool {
    key.starts_with("__") || UserProperty::from_str(key).is_ok()
}

/// Validates that none of `custom_user_data`'s keys collide with reserved protocol properties,
/// and that every key/value is non-empty and valid UTF-8 once encoded.
///
/// # Errors
/// Returns [`AIOProtocolError`] of kind
/// [`ArgumentInvalid`](crate::common::aio_protocol_error::AIOProtocolErrorKind::ArgumentInvalid)
/// if a reserved key is used.
pub fn validate_custom_user_data(
    custom_user_data: &[(String, String)],
) -> Result<(), AIOProtocolError> {
    for (key, _) in custom_user_data {
        if is_reserved(key) {
            return Err(AIOProtocolError::new_argument_invalid_error(
                "custom_user_data",
                Value::String(key.clone()),
                Some(format!(
                    "Custom user data key '{key}' uses the reserved '__' prefix"
                )),
            ));
        }
    }
    Ok(())
}
