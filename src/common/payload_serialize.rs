// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The content-type-aware bytes-to-value codec boundary used by commands and telemetry.

use std::error::Error;
use std::fmt::Debug;

/// A boxed error suitable for use as a [`PayloadSerialize::SerializerError`] when a serializer
/// does not need a more specific error type.
pub type SerializerError = Box<dyn Error + Sync + Send + 'static>;

/// MQTT v5 payload format indicator.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FormatIndicator {
    /// Unspecified bytes.
    #[default]
    UnspecifiedBytes = 0,
    /// UTF-8 encoded character data (e.g. JSON).
    Utf8EncodedCharacterData = 1,
}

impl TryFrom<u8> for FormatIndicator {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FormatIndicator::UnspecifiedBytes),
            1 => Ok(FormatIndicator::Utf8EncodedCharacterData),
            other => Err(other),
        }
    }
}

/// Converts a value to and from the bytes carried on an MQTT PUBLISH payload.
///
/// # Examples
/// ```
/// use azure_iot_operations_protocol::common::payload_serialize::{PayloadSerialize, SerializerError, FormatIndicator};
/// #[derive(Clone, Debug)]
/// pub struct CarLocationResponse {
///   latitude: f64,
///   longitude: f64,
/// }
/// impl PayloadSerialize for CarLocationResponse {
///   type SerializerError = SerializerError;
///   fn content_type() -> &'static str {
///     "application/json"
///   }
///   fn format_indicator() -> FormatIndicator {
///    FormatIndicator::Utf8EncodedCharacterData
///   }
///   fn serialize(&self) -> Result<Vec<u8>, SerializerError> {
///     let response = format!("{{\"latitude\": {}, \"longitude\": {}}}", self.latitude, self.longitude);
///     Ok(response.as_bytes().to_vec())
///   }
///   fn deserialize(payload: &[u8], _content_type: Option<&String>, _format_indicator: &FormatIndicator) -> Result<Self, SerializerError> {
///     let _payload = String::from_utf8(payload.to_vec())?;
///     Ok(CarLocationResponse {latitude: 12.0, longitude: 35.0})
///   }
/// }
/// ```
pub trait PayloadSerialize: Clone {
    /// The error returned by [`PayloadSerialize::serialize`]/[`PayloadSerialize::deserialize`].
    type SerializerError: Debug + Into<Box<dyn Error + Sync + Send + 'static>>;

    /// The MIME content type this type serializes to, e.g. `application/json`.
    fn content_type() -> &'static str;

    /// The payload format indicator this type serializes to.
    fn format_indicator() -> FormatIndicator;

    /// Serializes `self` to bytes.
    ///
    /// # Errors
    /// Returns [`PayloadSerialize::SerializerError`] if serialization fails.
    fn serialize(&self) -> Result<Vec<u8>, Self::SerializerError>;

    /// Deserializes `payload` into `Self`, given the content type and format indicator the
    /// bytes were received with.
    ///
    /// # Errors
    /// Returns [`PayloadSerialize::SerializerError`] if `content_type` is unsupported or the
    /// bytes do not deserialize to a valid `Self`.
    fn deserialize(
        payload: &[u8],
        content_type: Option<&String>,
        format_indicator: &FormatIndicator,
    ) -> Result<Self, Self::SerializerError>;
}

impl PayloadSerialize for Vec<u8> {
    type SerializerError = SerializerError;

    fn content_type() -> &'static str {
        "application/octet-stream"
    }

    fn format_indicator() -> FormatIndicator {
        FormatIndicator::UnspecifiedBytes
    }

    fn serialize(&self) -> Result<Vec<u8>, Self::SerializerError> {
        Ok(self.clone())
    }

    fn deserialize(
        payload: &[u8],
        _content_type: Option<&String>,
        _format_indicator: &FormatIndicator,
    ) -> Result<Self, Self::SerializerError> {
        Ok(payload.to_vec())
    }
}

#[cfg(test)]
use mockall::mock;
#[cfg(test)]
mock! {
    #[derive(Debug)]
    pub Payload{}
    impl Clone for Payload {
        fn clone(&self) -> Self;
    }
    impl PayloadSerialize for Payload {
        type SerializerError = String;
        fn content_type() -> &'static str;
        fn format_indicator() -> FormatIndicator;
        fn serialize(&self) -> Result<Vec<u8>, String>;
        fn deserialize<'a>(payload: &[u8], content_type: Option<&'a String>, format_indicator: &FormatIndicator) -> Result<Self, String>;
    }
}
