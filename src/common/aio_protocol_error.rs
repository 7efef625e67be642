// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A single tagged error type shared by every public fallible operation in this crate.

use std::{error::Error as StdError, fmt};

/// A value attached to an [`AIOProtocolError`] describing the offending property.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A string value.
    String(String),
    /// An integer value.
    Integer(i64),
    /// A boolean value.
    Boolean(bool),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{s}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Boolean(b) => write!(f, "{b}"),
        }
    }
}

/// Classification of an [`AIOProtocolError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AIOProtocolErrorKind {
    /// An argument provided to a method was invalid.
    ArgumentInvalid,
    /// A value used to configure a component was invalid.
    ConfigurationInvalid,
    /// The component was in a state that did not permit the requested operation.
    StateInvalid,
    /// The payload of a message could not be serialized or deserialized.
    PayloadInvalid,
    /// A required MQTT user property or header was missing.
    HeaderMissing,
    /// An MQTT user property or header had an invalid value.
    HeaderInvalid,
    /// The underlying MQTT client returned an error.
    MqttError,
    /// An operation did not complete within its configured timeout.
    Timeout,
    /// The content type of a message was not supported by the receiver.
    UnsupportedMediaType,
    /// A remote command execution failed and the failure was surfaced to the application.
    ExecutionException,
    /// A remote invocation failed for reasons outside of the application's command logic.
    InvocationException,
    /// An internal invariant of the protocol implementation was violated.
    InternalLogicError,
    /// The remote command version is not supported.
    UnsupportedVersion,
    /// An unrecognized error occurred.
    UnknownError,
    /// The operation was cancelled before it could complete.
    Cancellation,
}

impl fmt::Display for AIOProtocolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The single error type returned by every fallible public operation in this crate.
///
/// Modeled after the wire-level status/header contract used between invoker and executor so
/// that an error observed locally (a builder validation failure) and an error reported remotely
/// (an executor's status header) share the same shape.
#[derive(Debug)]
pub struct AIOProtocolError {
    /// What kind of error this is.
    pub kind: AIOProtocolErrorKind,
    /// A human-readable description of the error.
    pub message: Option<String>,
    /// The name of the offending property, header, or argument, if applicable.
    pub property_name: Option<String>,
    /// The value of the offending property, header, or argument, if applicable.
    pub property_value: Option<Value>,
    /// The name of the command this error pertains to, if applicable.
    pub command_name: Option<String>,
    /// The correlation data of the request/response this error pertains to, if applicable.
    pub correlation_id: Option<String>,
    /// The name of the timed-out operation, if `kind` is [`Timeout`](AIOProtocolErrorKind::Timeout).
    pub timeout_name: Option<String>,
    /// The configured timeout value, if `kind` is [`Timeout`](AIOProtocolErrorKind::Timeout).
    pub timeout_value: Option<std::time::Duration>,
    /// The HTTP-like status code this error was derived from, if received over the wire.
    pub http_status_code: Option<u16>,
    /// The name of the offending MQTT header, if different from `property_name`.
    pub header_name: Option<String>,
    /// The value of the offending MQTT header, if different from `property_value`.
    pub header_value: Option<String>,
    /// True if the error was detected before any network I/O occurred (e.g. builder validation).
    pub is_shallow: bool,
    /// True if the error originated in application/handler code rather than the protocol layer.
    pub in_application: bool,
    /// True if the error was reported by a remote peer rather than detected locally.
    pub is_remote: bool,
    /// The underlying cause, if any.
    pub nested_error: Option<Box<dyn StdError + Send + Sync>>,
}

impl fmt::Display for AIOProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        if let Some(name) = &self.property_name {
            write!(f, " (property: {name})")?;
        }
        Ok(())
    }
}

impl StdError for AIOProtocolError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.nested_error
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl AIOProtocolError {
    fn base(kind: AIOProtocolErrorKind) -> Self {
        Self {
            kind,
            message: None,
            property_name: None,
            property_value: None,
            command_name: None,
            correlation_id: None,
            timeout_name: None,
            timeout_value: None,
            http_status_code: None,
            header_name: None,
            header_value: None,
            is_shallow: false,
            in_application: false,
            is_remote: false,
            nested_error: None,
        }
    }

    /// Constructs an [`ArgumentInvalid`](AIOProtocolErrorKind::ArgumentInvalid) error.
    #[must_use]
    pub fn new_argument_invalid_error(
        property_name: &str,
        property_value: Value,
        message: Option<String>,
    ) -> Self {
        Self {
            property_name: Some(property_name.to_string()),
            property_value: Some(property_value),
            message,
            is_shallow: true,
            ..Self::base(AIOProtocolErrorKind::ArgumentInvalid)
        }
    }

    /// Constructs a [`ConfigurationInvalid`](AIOProtocolErrorKind::ConfigurationInvalid) error.
    #[must_use]
    pub fn new_configuration_invalid_error(
        nested_error: Option<Box<dyn StdError + Send + Sync>>,
        property_name: &str,
        property_value: Value,
        message: Option<String>,
        command_name: Option<String>,
    ) -> Self {
        Self {
            property_name: Some(property_name.to_string()),
            property_value: Some(property_value),
            message,
            command_name,
            nested_error,
            is_shallow: true,
            ..Self::base(AIOProtocolErrorKind::ConfigurationInvalid)
        }
    }

    /// Constructs a [`StateInvalid`](AIOProtocolErrorKind::StateInvalid) error.
    #[must_use]
    pub fn new_state_invalid_error(
        property_name: &str,
        message: Option<String>,
        is_remote: bool,
    ) -> Self {
        Self {
            property_name: Some(property_name.to_string()),
            message,
            is_remote,
            ..Self::base(AIOProtocolErrorKind::StateInvalid)
        }
    }

    /// Constructs a [`PayloadInvalid`](AIOProtocolErrorKind::PayloadInvalid) error.
    #[must_use]
    pub fn new_payload_invalid_error(
        nested_error: Option<Box<dyn StdError + Send + Sync>>,
        message: Option<String>,
    ) -> Self {
        Self {
            message,
            nested_error,
            ..Self::base(AIOProtocolErrorKind::PayloadInvalid)
        }
    }

    /// Constructs a [`HeaderMissing`](AIOProtocolErrorKind::HeaderMissing) error.
    #[must_use]
    pub fn new_header_missing_error(header_name: &str, is_remote: bool) -> Self {
        Self {
            header_name: Some(header_name.to_string()),
            property_name: Some(header_name.to_string()),
            message: Some(format!("Header '{header_name}' is missing")),
            is_remote,
            ..Self::base(AIOProtocolErrorKind::HeaderMissing)
        }
    }

    /// Constructs a [`HeaderInvalid`](AIOProtocolErrorKind::HeaderInvalid) error.
    #[must_use]
    pub fn new_header_invalid_error(
        header_name: &str,
        header_value: &str,
        message: Option<String>,
        is_remote: bool,
    ) -> Self {
        Self {
            header_name: Some(header_name.to_string()),
            header_value: Some(header_value.to_string()),
            property_name: Some(header_name.to_string()),
            property_value: Some(Value::String(header_value.to_string())),
            message,
            is_remote,
            ..Self::base(AIOProtocolErrorKind::HeaderInvalid)
        }
    }

    /// Constructs an [`MqttError`](AIOProtocolErrorKind::MqttError) error.
    #[must_use]
    pub fn new_mqtt_error(
        message: Option<String>,
        nested_error: Box<dyn StdError + Send + Sync>,
        command_name: Option<String>,
    ) -> Self {
        Self {
            message,
            command_name,
            nested_error: Some(nested_error),
            ..Self::base(AIOProtocolErrorKind::MqttError)
        }
    }

    /// Constructs a [`Timeout`](AIOProtocolErrorKind::Timeout) error.
    #[must_use]
    pub fn new_timeout_error(
        timeout_name: &str,
        timeout_value: std::time::Duration,
        correlation_id: Option<String>,
        command_name: Option<String>,
    ) -> Self {
        Self {
            timeout_name: Some(timeout_name.to_string()),
            timeout_value: Some(timeout_value),
            correlation_id,
            command_name,
            message: Some(format!("Timed out waiting on '{timeout_name}'")),
            ..Self::base(AIOProtocolErrorKind::Timeout)
        }
    }

    /// Constructs an [`UnsupportedMediaType`](AIOProtocolErrorKind::UnsupportedMediaType) error.
    #[must_use]
    pub fn new_unsupported_media_type_error(
        property_name: &str,
        property_value: Value,
        message: Option<String>,
        is_remote: bool,
    ) -> Self {
        Self {
            property_name: Some(property_name.to_string()),
            property_value: Some(property_value),
            message,
            is_remote,
            ..Self::base(AIOProtocolErrorKind::UnsupportedMediaType)
        }
    }

    /// Constructs an [`ExecutionException`](AIOProtocolErrorKind::ExecutionException) error.
    #[must_use]
    pub fn new_execution_exception(
        command_name: Option<String>,
        correlation_id: Option<String>,
        message: Option<String>,
    ) -> Self {
        Self {
            command_name,
            correlation_id,
            message,
            in_application: true,
            is_remote: true,
            ..Self::base(AIOProtocolErrorKind::ExecutionException)
        }
    }

    /// Constructs an [`InvocationException`](AIOProtocolErrorKind::InvocationException) error.
    #[must_use]
    pub fn new_invocation_exception(
        command_name: Option<String>,
        correlation_id: Option<String>,
        property_name: Option<String>,
        property_value: Option<Value>,
        message: Option<String>,
    ) -> Self {
        Self {
            command_name,
            correlation_id,
            property_name,
            property_value,
            message,
            in_application: true,
            is_remote: true,
            ..Self::base(AIOProtocolErrorKind::InvocationException)
        }
    }

    /// Constructs an [`InternalLogicError`](AIOProtocolErrorKind::InternalLogicError) error.
    #[must_use]
    pub fn new_internal_logic_error(
        is_remote: bool,
        property_name: Option<String>,
        message: Option<String>,
    ) -> Self {
        Self {
            property_name,
            message,
            is_remote,
            ..Self::base(AIOProtocolErrorKind::InternalLogicError)
        }
    }

    /// Constructs an [`UnsupportedVersion`](AIOProtocolErrorKind::UnsupportedVersion) error.
    #[must_use]
    pub fn new_unsupported_version_error(
        command_name: Option<String>,
        supported_versions: &[u16],
        requested_version: &str,
    ) -> Self {
        Self {
            command_name,
            property_name: Some("requestProtocolVersion".to_string()),
            property_value: Some(Value::String(requested_version.to_string())),
            message: Some(format!(
                "Unsupported protocol version '{requested_version}'. Supported major versions: {supported_versions:?}"
            )),
            is_remote: true,
            ..Self::base(AIOProtocolErrorKind::UnsupportedVersion)
        }
    }

    /// Constructs an [`UnknownError`](AIOProtocolErrorKind::UnknownError) error.
    #[must_use]
    pub fn new_unknown_error(
        is_remote: bool,
        in_application: bool,
        message: Option<String>,
        command_name: Option<String>,
    ) -> Self {
        Self {
            message,
            is_remote,
            in_application,
            command_name,
            ..Self::base(AIOProtocolErrorKind::UnknownError)
        }
    }

    /// Constructs a [`Cancellation`](AIOProtocolErrorKind::Cancellation) error.
    #[must_use]
    pub fn new_cancellation_error(command_name: Option<String>, correlation_id: Option<String>) -> Self {
        Self {
            command_name,
            correlation_id,
            message: Some("The operation was cancelled".to_string()),
            ..Self::base(AIOProtocolErrorKind::Cancellation)
        }
    }
}
