// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! CloudEvents v1.0 metadata attached to telemetry, and optionally to command responses.
//!
//! See [CloudEvents Spec](https://github.com/cloudevents/spec/blob/main/cloudevents/spec.md).

use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

const DEFAULT_CLOUD_EVENT_SPEC_VERSION: &str = "1.0";

/// The CloudEvents attribute names, as they appear as MQTT user property keys.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CloudEventFields {
    /// `id`
    Id,
    /// `source`
    Source,
    /// `specversion`
    SpecVersion,
    /// `type`
    EventType,
    /// `subject`
    Subject,
    /// `time`
    Time,
    /// `datacontenttype`
    DataContentType,
    /// `dataschema`
    DataSchema,
}

impl Display for CloudEventFields {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloudEventFields::SpecVersion => "specversion",
            CloudEventFields::EventType => "type",
            CloudEventFields::Source => "source",
            CloudEventFields::Id => "id",
            CloudEventFields::Subject => "subject",
            CloudEventFields::Time => "time",
            CloudEventFields::DataContentType => "datacontenttype",
            CloudEventFields::DataSchema => "dataschema",
        };
        write!(f, "{s}")
    }
}

impl FromStr for CloudEventFields {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "id" => Ok(CloudEventFields::Id),
            "source" => Ok(CloudEventFields::Source),
            "specversion" => Ok(CloudEventFields::SpecVersion),
            "type" => Ok(CloudEventFields::EventType),
            "subject" => Ok(CloudEventFields::Subject),
            "dataschema" => Ok(CloudEventFields::DataSchema),
            "datacontenttype" => Ok(CloudEventFields::DataContentType),
            "time" => Ok(CloudEventFields::Time),
            _ => Err(()),
        }
    }
}

/// What a [`CloudEvent`]'s `subject` attribute should be set to when sent.
#[derive(Clone, Debug)]
pub enum CloudEventSubject {
    /// Use the message's publish topic as the subject.
    PublishTopic,
    /// Use a caller-provided subject.
    Custom(String),
    /// Omit the subject attribute.
    None,
}

/// A CloudEvents v1.0 envelope, usable both to decorate an outgoing telemetry or command
/// response message, and to parse one back out of an inbound message's custom user properties.
#[derive(Builder, Clone, Debug)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct CloudEvent {
    /// Identifies the context in which an event happened, e.g. the asset or device that
    /// produced it.
    pub source: String,
    /// The CloudEvents spec version in use. Only `1.0` is currently supported.
    #[builder(default = "DEFAULT_CLOUD_EVENT_SPEC_VERSION.to_string()")]
    pub spec_version: String,
    /// Describes the type of event related to the originating occurrence.
    #[builder(default = "self.custom_default_event_type()")]
    pub event_type: String,
    /// Identifies the schema that the message payload adheres to.
    #[builder(default = "None")]
    pub data_schema: Option<String>,
    /// Content type of the message payload. Populated automatically from the message when
    /// parsed via [`CloudEvent::from_user_properties`].
    #[builder(default = "None")]
    pub data_content_type: Option<String>,
    /// Uniquely identifies this event, together with `source`. Defaults to a fresh UUID when
    /// building an outgoing event.
    #[builder(default = "Uuid::new_v4().to_string()")]
    pub id: String,
    /// Timestamp of the occurrence.
    #[builder(default = "Some(Utc::now())")]
    #[builder(setter(skip))]
    pub time: Option<DateTime<Utc>>,
    /// The `subject` attribute to use when sending. Ignored when parsing an inbound event.
    #[builder(default = "CloudEventSubject::PublishTopic")]
    pub subject: CloudEventSubject,
    #[builder(private, default = "String::new()")]
    _default_event_type: String,
    /// `time` as a string, captured during parsing so it can be validated by the builder before
    /// being converted to a [`DateTime`].
    #[builder(default = "None")]
    builder_time: Option<String>,
}

impl CloudEventBuilder {
    /// Constructs a new builder with the given default `event_type`, used if `event_type` is
    /// never explicitly set.
    #[must_use]
    pub fn new(default_event_type: impl Into<String>) -> Self {
        CloudEventBuilder {
            _default_event_type: Some(default_event_type.into()),
            ..Default::default()
        }
    }

    fn custom_default_event_type(&self) -> String {
        self._default_event_type.clone().unwrap_or_default()
    }

    fn validate(&self) -> Result<(), String> {
        let spec_version = self
            .spec_version
            .clone()
            .unwrap_or_else(|| DEFAULT_CLOUD_EVENT_SPEC_VERSION.to_string());
        if spec_version != "1.0" {
            return Err(format!("Unsupported CloudEvents spec_version '{spec_version}'"));
        }
        if let Some(source) = &self.source {
            if source.is_empty() {
                return Err("source cannot be empty".to_string());
            }
        }
        if let Some(event_type) = &self.event_type {
            if event_type.is_empty() {
                return Err("event_type cannot be empty".to_string());
            }
        }
        if let Some(id) = &self.id {
            if id.is_empty() {
                return Err("id cannot be empty".to_string());
            }
        }
        if let Some(Some(builder_time)) = &self.builder_time {
            DateTime::parse_from_rfc3339(builder_time)
                .map_err(|e| format!("time is not a valid RFC3339 timestamp: {e}"))?;
        }
        Ok(())
    }
}

impl CloudEvent {
    /// Renders this event as MQTT user property key/value pairs, ready to attach to a PUBLISH.
    #[must_use]
    pub fn into_headers(self, publish_topic: &str) -> Vec<(String, String)> {
        let mut headers = vec![
            (CloudEventFields::Id.to_string(), self.id),
            (CloudEventFields::Source.to_string(), self.source),
            (CloudEventFields::SpecVersion.to_string(), self.spec_version),
            (CloudEventFields::EventType.to_string(), self.event_type),
        ];
        match self.subject {
            CloudEventSubject::Custom(subject) => {
                headers.push((CloudEventFields::Subject.to_string(), subject));
            }
            CloudEventSubject::PublishTopic => {
                headers.push((
                    CloudEventFields::Subject.to_string(),
                    publish_topic.to_string(),
                ));
            }
            CloudEventSubject::None => {}
        }
        if let Some(data_schema) = self.data_schema {
            headers.push((CloudEventFields::DataSchema.to_string(), data_schema));
        }
        if let Some(data_content_type) = self.data_content_type {
            headers.push((
                CloudEventFields::DataContentType.to_string(),
                data_content_type,
            ));
        }
        if let Some(time) = self.time {
            headers.push((
                CloudEventFields::Time.to_string(),
                time.to_rfc3339_opts(SecondsFormat::Secs, true),
            ));
        }
        headers
    }

    /// Parses a [`CloudEvent`] out of an inbound message's custom user properties.
    ///
    /// Returns `Ok(None)` if none of the CloudEvents attributes are present (the message simply
    /// was not sent with CloudEvents metadata), rather than an error.
    ///
    /// # Errors
    /// Returns [`CloudEventBuilderError`] if some CloudEvents attributes are present but a
    /// required one (`source`, `id`) is missing, or a present attribute's value is invalid.
    pub fn from_user_properties(
        custom_user_data: &[(String, String)],
        content_type: Option<&String>,
    ) -> Result<Option<Self>, CloudEventBuilderError> {
        let mut builder = CloudEventBuilder::default();
        let mut any_present = false;

        if let Some(content_type) = content_type {
            builder.data_content_type(content_type.clone());
        }

        for (key, value) in custom_user_data {
            match CloudEventFields::from_str(key) {
                Ok(CloudEventFields::Id) => {
                    any_present = true;
                    builder.id(value.clone());
                }
                Ok(CloudEventFields::Source) => {
                    any_present = true;
                    builder.source(value.clone());
                }
                Ok(CloudEventFields::SpecVersion) => {
                    any_present = true;
                    builder.spec_version(value.clone());
                }
                Ok(CloudEventFields::EventType) => {
                    any_present = true;
                    builder.event_type(value.clone());
                }
                Ok(CloudEventFields::Subject) => {
                    any_present = true;
                    builder.subject(CloudEventSubject::Custom(value.clone()));
                }
                Ok(CloudEventFields::DataSchema) => {
                    any_present = true;
                    builder.data_schema(Some(value.clone()));
                }
                Ok(CloudEventFields::Time) => {
                    any_present = true;
                    builder.builder_time(Some(value.clone()));
                }
                Ok(CloudEventFields::DataContentType) | Err(()) => {}
            }
        }

        if !any_present {
            return Ok(None);
        }

        let mut cloud_event = builder.build()?;
        if let Some(time_str) = &cloud_event.builder_time {
            let parsed = DateTime::parse_from_rfc3339(time_str)
                .expect("builder validation already checked this parses");
            cloud_event.time = Some(parsed.with_timezone(&Utc));
        } else {
            cloud_event.time = None;
        }
        Ok(Some(cloud_event))
    }
}

impl Display for CloudEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CloudEvent {{ id: {}, source: {}, spec_version: {}, event_type: {}, data_schema: {:?}, data_content_type: {:?}, time: {:?} }}",
            self.id, self.source, self.spec_version, self.event_type, self.data_schema, self.data_content_type, self.time
        )
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(CloudEventFields::SpecVersion; "spec_version")]
    #[test_case(CloudEventFields::EventType; "event_type")]
    #[test_case(CloudEventFields::Source; "source")]
    #[test_case(CloudEventFields::Id; "id")]
    #[test_case(CloudEventFields::Subject; "subject")]
    #[test_case(CloudEventFields::Time; "time")]
    #[test_case(CloudEventFields::DataContentType; "data_content_type")]
    #[test_case(CloudEventFields::DataSchema; "data_schema")]
    fn field_round_trips_through_string(field: CloudEventFields) {
        assert_eq!(field, CloudEventFields::from_str(&field.to_string()).unwrap());
    }

    #[test]
    fn from_user_properties_returns_none_when_absent() {
        let result = CloudEvent::from_user_properties(&[], None).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn build_then_parse_round_trips_required_fields() {
        let event = CloudEventBuilder::new("ms.aio.telemetry")
            .source("aio://test/asset")
            .build()
            .unwrap();
        let headers = event.clone().into_headers("test/topic");
        let parsed = CloudEvent::from_user_properties(&headers, None)
            .unwrap()
            .unwrap();
        assert_eq!(parsed.source, event.source);
        assert_eq!(parsed.id, event.id);
    }

    #[test]
    fn build_rejects_empty_source() {
        let result = CloudEventBuilder::new("ms.aio.telemetry").source("").build();
        assert!(result.is_err());
    }
}
