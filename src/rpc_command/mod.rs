// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Command invocation and execution: a request/response RPC pattern layered over MQTT publish
//! topics, with response caching and Hybrid Logical Clock ordering.

pub mod cache;
pub mod executor;
pub mod invoker;

pub use executor::Executor;
pub use invoker::Invoker;

use crate::common::{
    aio_protocol_error::AIOProtocolError, protocol_version::ProtocolVersion, user_properties::UserProperty,
};

/// Protocol version implemented by this crate's command invoker and executor.
pub(crate) const RPC_COMMAND_PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };
/// Assumed request protocol version if none is provided.
pub(crate) const DEFAULT_RPC_COMMAND_PROTOCOL_VERSION: ProtocolVersion =
    ProtocolVersion { major: 1, minor: 0 };
/// Major protocol versions this executor will accept on an incoming request.
pub(crate) const SUPPORTED_PROTOCOL_VERSIONS: &[u16] = &[1];
/// Default `CloudEvent` event type for a command response.
pub const DEFAULT_RPC_RESPONSE_CLOUD_EVENT_EVENT_TYPE: &str = "ms.aio.rpc.response";

/// HTTP-style status codes carried on a command response's `__stat` user property.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// The command executed successfully and returned a payload.
    Ok = 200,
    /// The command executed successfully and returned no payload.
    NoContent = 204,
    /// The request was malformed: an invalid or missing header, or an unparsable payload.
    BadRequest = 400,
    /// No executor is registered for the requested command.
    NotFound = 404,
    /// The request's message expiry interval elapsed before a response could be produced.
    RequestTimeout = 408,
    /// The request's content type or format indicator is not supported by the executor.
    UnsupportedMediaType = 415,
    /// The handler raised an application-level error while executing the command.
    UnprocessableContent = 422,
    /// The executor encountered an unexpected internal error.
    InternalServerError = 500,
    /// The executor is shutting down or otherwise unable to process requests right now.
    ServiceUnavailable = 503,
    /// Neither party's protocol major version is supported by the other.
    VersionNotSupported = 505,
}

impl TryFrom<u16> for StatusCode {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            200 => Ok(StatusCode::Ok),
            204 => Ok(StatusCode::NoContent),
            400 => Ok(StatusCode::BadRequest),
            404 => Ok(StatusCode::NotFound),
            408 => Ok(StatusCode::RequestTimeout),
            415 => Ok(StatusCode::UnsupportedMediaType),
            422 => Ok(StatusCode::UnprocessableContent),
            500 => Ok(StatusCode::InternalServerError),
            503 => Ok(StatusCode::ServiceUnavailable),
            505 => Ok(StatusCode::VersionNotSupported),
            other => Err(other),
        }
    }
}

impl StatusCode {
    /// Returns whether this status represents a successful command completion.
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, StatusCode::Ok | StatusCode::NoContent)
    }
}

/// Formats `supported_major_versions` as a space-separated list, the wire format used by the
/// `__supProtMajorVer` user property.
#[must_use]
pub(crate) fn supported_protocol_major_versions_to_string(supported_major_versions: &[u16]) -> String {
    supported_major_versions
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Identifies a command an [`Executor`] serves, and how an [`Invoker`] should address it.
///
/// Grouping these together avoids repeating the same five parameters across
/// [`executor::OptionsBuilder`] and [`invoker::OptionsBuilder`], and gives callers a single
/// value to pass from configuration into both.
#[derive(Debug, Clone)]
pub struct CommandDescriptor {
    /// The command's name, used both as a topic token and in diagnostics.
    pub command_name: String,
    /// The templated request topic, e.g. `"rpc/{modelId}/{commandName}"`.
    pub request_topic_pattern: String,
    /// Whether repeated invocations with the same request payload may reuse a previous
    /// response, even across different correlation data.
    pub is_idempotent: bool,
    /// How long a response to this command remains eligible for cross-correlation reuse once
    /// produced. Ignored if `is_idempotent` is false.
    pub cacheable_duration: Option<std::time::Duration>,
}

/// Builds the MQTT user properties describing an application-level command failure, shared by
/// [`Executor`] (when a handler reports a failure) and anything relaying one downstream.
#[must_use]
pub fn application_error_headers(
    app_err_code: Option<&str>,
    app_err_payload: Option<&str>,
) -> Vec<(String, String)> {
    let mut headers = vec![(UserProperty::IsApplicationError.to_string(), "true".to_string())];
    if let Some(code) = app_err_code {
        headers.push((UserProperty::AppErrCode.to_string(), code.to_string()));
    }
    if let Some(payload) = app_err_payload {
        headers.push((UserProperty::AppErrPayload.to_string(), payload.to_string()));
    }
    headers
}

/// Constructs an [`AIOProtocolError`] for a response whose `__stat` value is not a recognized
/// [`StatusCode`].
pub(crate) fn invalid_status_code_error(value: &str, command_name: Option<String>) -> AIOProtocolError {
    let mut error = AIOProtocolError::new_header_invalid_error(
        &UserProperty::Status.to_string(),
        value,
        Some(format!("'{value}' is not a recognized status code")),
        true,
    );
    error.command_name = command_name;
    error
}
