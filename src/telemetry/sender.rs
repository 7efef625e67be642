// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Publishes telemetry messages, attaching Hybrid Logical Clock timestamps and, optionally,
//! CloudEvents metadata.

use std::{collections::HashMap, marker::PhantomData, sync::Arc, time::Duration};

use crate::{
    application::{ApplicationContext, ApplicationHybridLogicalClock},
    common::{
        aio_protocol_error::AIOProtocolError,
        cloud_event::CloudEventBuilder,
        payload_serialize::PayloadSerialize,
        token_map::MergedTokenMap,
        topic_processor::TopicPattern,
        user_properties::{UserProperty, validate_custom_user_data},
    },
    mqtt::{
        control_packet::{PublishProperties, QoS},
        interface::{ManagedClient, MqttPubSub},
    },
    telemetry::{DEFAULT_TELEMETRY_CLOUD_EVENT_EVENT_TYPE, TELEMETRY_PROTOCOL_VERSION},
};

const DEFAULT_MESSAGE_EXPIRY_INTERVAL: Duration = Duration::from_secs(10);

/// A telemetry message ready to publish. Constructed via [`MessageBuilder`].
#[derive(Builder, Clone)]
#[builder(setter(into, strip_option), build_fn(validate = "Self::validate"))]
pub struct Message<T: PayloadSerialize> {
    /// The value to serialize and publish.
    payload: T,
    /// Custom MQTT user properties to attach, in addition to this crate's reserved ones.
    #[builder(default)]
    custom_user_data: Vec<(String, String)>,
    /// Transient topic tokens, overlaid on the sender's resident token map for this message
    /// only.
    #[builder(default)]
    topic_tokens: HashMap<String, String>,
    /// How long the broker may hold this message undelivered before discarding it.
    #[builder(default = "DEFAULT_MESSAGE_EXPIRY_INTERVAL")]
    message_expiry_interval: Duration,
    /// Whether to attach CloudEvents v1.0 metadata to the outgoing message.
    #[builder(default = "true")]
    cloud_event: bool,
    #[builder(private, default = "PhantomData")]
    payload_type: PhantomData<T>,
}

impl<T: PayloadSerialize> MessageBuilder<T> {
    fn validate(&self) -> Result<(), String> {
        if let Some(custom_user_data) = &self.custom_user_data {
            validate_custom_user_data(custom_user_data).map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

/// Telemetry Sender Options struct.
#[derive(Builder, Clone)]
#[builder(setter(into, strip_option))]
pub struct Options {
    /// Topic pattern for the telemetry message.
    topic_pattern: String,
    /// Optional topic namespace to be prepended to the topic pattern.
    #[builder(default = "None")]
    topic_namespace: Option<String>,
    /// Topic token keys/values to be permanently replaced in the topic pattern.
    #[builder(default)]
    topic_token_map: HashMap<String, String>,
}

/// Telemetry Sender struct.
pub struct Sender<T, C>
where
    T: PayloadSerialize + Send + Sync + 'static,
    C: ManagedClient + MqttPubSub + Send + Sync + 'static,
{
    application_hlc: Arc<ApplicationHybridLogicalClock>,
    mqtt_client: C,
    topic_pattern: TopicPattern,
    payload_type: PhantomData<T>,
}

impl<T, C> Sender<T, C>
where
    T: PayloadSerialize + Send + Sync + 'static,
    C: ManagedClient + MqttPubSub + Send + Sync + 'static,
{
    /// Creates a new [`Sender`].
    ///
    /// # Errors
    /// [`AIOProtocolError`] of kind
    /// [`ConfigurationInvalid`](crate::common::aio_protocol_error::AIOProtocolErrorKind::ConfigurationInvalid)
    /// if the topic pattern, namespace, or token map is invalid.
    pub fn new(application_context: ApplicationContext, client: C, sender_options: Options) -> Result<Self, AIOProtocolError> {
        let topic_pattern = TopicPattern::new(
            &sender_options.topic_pattern,
            sender_options.topic_namespace.as_deref(),
            &sender_options.topic_token_map,
        )?;

        Ok(Self {
            application_hlc: application_context.application_hlc,
            mqtt_client: client,
            topic_pattern,
            payload_type: PhantomData,
        })
    }

    /// Serializes and publishes `message`.
    ///
    /// # Errors
    /// [`AIOProtocolError`] of kind
    /// [`PayloadInvalid`](crate::common::aio_protocol_error::AIOProtocolErrorKind::PayloadInvalid)
    /// if serialization fails.
    ///
    /// [`AIOProtocolError`] of kind
    /// [`ArgumentInvalid`](crate::common::aio_protocol_error::AIOProtocolErrorKind::ArgumentInvalid)
    /// if a resolved publish topic token is missing.
    ///
    /// [`AIOProtocolError`] of kind
    /// [`MqttError`](crate::common::aio_protocol_error::AIOProtocolErrorKind::MqttError) if the
    /// publish or its acknowledgement fails.
    pub async fn send(&self, message: Message<T>) -> Result<(), AIOProtocolError> {
        validate_custom_user_data(&message.custom_user_data)?;

        let serialized_payload = message
            .payload
            .serialize()
            .map_err(|e| AIOProtocolError::new_payload_invalid_error(Some(e.into()), None))?;

        let empty_resident = HashMap::new();
        let merged_tokens = MergedTokenMap::new(&empty_resident, &message.topic_tokens).to_owned_map();
        let publish_topic = self.topic_pattern.as_publish_topic(&merged_tokens)?;

        let timestamp = self.application_hlc.update_now()?;

        let mut user_properties = vec![
            (UserProperty::Timestamp.to_string(), timestamp),
            (UserProperty::ProtocolVersion.to_string(), TELEMETRY_PROTOCOL_VERSION.to_string()),
            (UserProperty::SourceId.to_string(), self.mqtt_client.client_id().to_string()),
        ];
        user_properties.extend(message.custom_user_data);

        if message.cloud_event {
            let cloud_event = CloudEventBuilder::new(DEFAULT_TELEMETRY_CLOUD_EVENT_EVENT_TYPE)
                .source(self.mqtt_client.client_id().to_string())
                .data_content_type(T::content_type().to_string())
                .build()
                .map_err(|e| {
                    AIOProtocolError::new_internal_logic_error(
                        false,
                        None,
                        Some(format!("Failed to build CloudEvent: {e}")),
                    )
                })?;
            user_properties.extend(cloud_event.into_headers(&publish_topic));
        }

        let properties = PublishProperties {
            correlation_data: None,
            response_topic: None,
            content_type: Some(T::content_type().to_string()),
            payload_format_indicator: T::format_indicator() as u8,
            message_expiry_interval: Some(
                u32::try_from(message.message_expiry_interval.as_secs()).unwrap_or(u32::MAX),
            ),
            user_properties,
        };

        let publish_result = self
            .mqtt_client
            .publish(publish_topic, QoS::AtLeastOnce, false, serialized_payload, Some(properties))
            .await;

        match publish_result {
            Ok(completion_token) => completion_token.await.map_err(|e| {
                AIOProtocolError::new_mqtt_error(
                    Some("MQTT error on telemetry send puback".to_string()),
                    Box::new(e),
                    None,
                )
            }),
            Err(e) => Err(AIOProtocolError::new_mqtt_error(
                Some("Client error on telemetry send publish".to_string()),
                Box::new(e),
                None,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        application::ApplicationContextBuilder,
        common::payload_serialize::{FormatIndicator, MockPayload},
        mqtt::mock::MockClient,
    };

    #[test]
    fn test_new_defaults() {
        let client = MockClient::new("test_sender");
        let sender_options = OptionsBuilder::default().topic_pattern("test/telemetry").build().unwrap();

        Sender::<MockPayload, _>::new(
            ApplicationContextBuilder::default().build().unwrap(),
            client,
            sender_options,
        )
        .unwrap();
    }

    #[tokio::test]
    async fn send_publishes_reserved_and_custom_headers() {
        let client = MockClient::new("test_sender");
        let sender_options = OptionsBuilder::default().topic_pattern("test/telemetry").build().unwrap();
        let sender = Sender::<MockPayload, _>::new(
            ApplicationContextBuilder::default().build().unwrap(),
            client.clone(),
            sender_options,
        )
        .unwrap();

        let content_type_ctx = MockPayload::content_type_context();
        content_type_ctx.expect().return_const("application/json");
        let format_indicator_ctx = MockPayload::format_indicator_context();
        format_indicator_ctx.expect().return_const(FormatIndicator::UnspecifiedBytes);

        let mut payload = MockPayload::new();
        payload.expect_clone().returning(MockPayload::new);
        payload.expect_serialize().returning(|| Ok(b"hello".to_vec()));

        let message = MessageBuilder::default().payload(payload).cloud_event(false).build().unwrap();
        sender.send(message).await.unwrap();

        let calls = client.calls();
        assert_eq!(calls.len(), 1);
    }
}
