// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::{collections::HashMap, marker::PhantomData, str::FromStr, sync::Arc};

use tokio_util::sync::CancellationToken;

use crate::{
    application::{ApplicationContext, ApplicationHybridLogicalClock},
    common::{
        aio_protocol_error::{AIOProtocolError, Value},
        cloud_event::CloudEvent,
        hybrid_logical_clock::HybridLogicalClock,
        payload_serialize::{FormatIndicator, PayloadSerialize},
        protocol_version::ProtocolVersion,
        topic_processor::TopicPattern,
        user_properties::UserProperty,
    },
    mqtt::{
        control_packet::{Publish, QoS},
        interface::{AckToken, ManagedClient, PubReceiver},
    },
    telemetry::DEFAULT_TELEMETRY_PROTOCOL_VERSION,
};

const SUPPORTED_PROTOCOL_VERSIONS: &[u16] = &[1];

/// Telemetry message struct.
/// Used by the [`Receiver`].
#[derive(Debug)]
pub struct Message<T: PayloadSerialize> {
    /// Payload of the telemetry message. Must implement [`PayloadSerialize`].
    pub payload: T,
    /// Content Type of the telemetry message.
    pub content_type: Option<String>,
    /// Format Indicator of the telemetry message.
    pub format_indicator: FormatIndicator,
    /// Custom user data set as custom MQTT User Properties on the telemetry message.
    pub custom_user_data: Vec<(String, String)>,
    /// If present, contains the client ID of the sender of the telemetry message.
    pub sender_id: Option<String>,
    /// Timestamp of the telemetry message.
    pub timestamp: Option<HybridLogicalClock>,
    /// Resolved static and dynamic topic tokens from the incoming message's topic.
    pub topic_tokens: HashMap<String, String>,
    /// Incoming message topic
    pub topic: String,
}

impl<T: PayloadSerialize> Message<T> {
    /// Parses a [`CloudEvent`] out of this message's custom user properties, if it was sent
    /// with CloudEvents metadata.
    ///
    /// # Errors
    /// Returns an error if some CloudEvents attributes are present but a required one is
    /// missing or invalid.
    pub fn cloud_event(
        &self,
    ) -> Result<Option<CloudEvent>, crate::common::cloud_event::CloudEventBuilderError> {
        CloudEvent::from_user_properties(&self.custom_user_data, self.content_type.as_ref())
    }
}

impl<T> TryFrom<Publish> for Message<T>
where
    T: PayloadSerialize,
{
    type Error = String;

    fn try_from(value: Publish) -> Result<Message<T>, Self::Error> {
        // User properties are parsed into a HashMap up front: it makes the lookups below more
        // readable, and means we only ever hold one copy of the properties around.
        let publish_properties = value.properties.ok_or("Publish contains no properties")?;

        let expected_aio_properties = [
            UserProperty::Timestamp,
            UserProperty::ProtocolVersion,
            UserProperty::SourceId,
        ];
        let mut telemetry_custom_user_data = vec![];
        let mut telemetry_aio_data = HashMap::new();
        for (key, value) in publish_properties.user_properties {
            match UserProperty::from_str(&key) {
                Ok(p) if expected_aio_properties.contains(&p) => {
                    telemetry_aio_data.insert(p, value);
                }
                Ok(_) => {
                    log::warn!(
                        "Telemetry should not contain MQTT user property '{key}'. Value is '{value}'"
                    );
                    telemetry_custom_user_data.push((key, value));
                }
                Err(()) => {
                    telemetry_custom_user_data.push((key, value));
                }
            }
        }

        // The protocol version gates everything else: if it can't be parsed or isn't
        // supported, no other field can be trusted to mean what this crate thinks it means.
        let protocol_version = match telemetry_aio_data.get(&UserProperty::ProtocolVersion) {
            Some(protocol_version) => ProtocolVersion::parse_protocol_version(protocol_version)
                .ok_or_else(|| {
                    format!(
                        "Received a telemetry with an unparsable protocol version number: {protocol_version}"
                    )
                })?,
            None => DEFAULT_TELEMETRY_PROTOCOL_VERSION,
        };
        if !protocol_version.is_supported(SUPPORTED_PROTOCOL_VERSIONS) {
            return Err(format!(
                "Unsupported protocol version '{protocol_version}'. Only major protocol versions '{SUPPORTED_PROTOCOL_VERSIONS:?}' are supported"
            ));
        }

        let timestamp = telemetry_aio_data
            .get(&UserProperty::Timestamp)
            .map(|s| HybridLogicalClock::from_str(s))
            .transpose()
            .map_err(|e| e.to_string())?;

        let topic = std::str::from_utf8(&value.topic)
            .map_err(|e| e.to_string())?
            .to_string();

        let format_indicator = publish_properties.payload_format_indicator.try_into().unwrap_or_else(|e| {
            log::error!("Received invalid payload format indicator: {e}. This should not be possible to receive from the broker. Using default.");
            FormatIndicator::default()
        });
        let content_type = publish_properties.content_type;
        let payload = T::deserialize(&value.payload, content_type.as_ref(), &format_indicator)
            .map_err(|e| format!("{e:?}"))?;

        Ok(Message {
            payload,
            content_type,
            format_indicator,
            custom_user_data: telemetry_custom_user_data,
            sender_id: telemetry_aio_data.remove(&UserProperty::SourceId),
            timestamp,
            // Topic tokens can't be resolved from just a Publish; the Receiver fills these in.
            topic_tokens: HashMap::default(),
            topic,
        })
    }
}

/// Telemetry Receiver Options struct
#[derive(Builder, Clone)]
#[builder(setter(into, strip_option))]
pub struct Options {
    /// Topic pattern for the telemetry message.
    topic_pattern: String,
    /// Optional Topic namespace to be prepended to the topic pattern
    #[builder(default = "None")]
    topic_namespace: Option<String>,
    /// Topic token keys/values to be permanently replaced in the topic pattern
    #[builder(default)]
    topic_token_map: HashMap<String, String>,
    /// If true, telemetry messages are auto-acknowledged
    #[builder(default = "true")]
    auto_ack: bool,
    /// Shared-subscription group id, so multiple receiver instances split the same telemetry
    /// stream instead of each receiving every message.
    #[builder(default = "None")]
    #[allow(unused)]
    service_group_id: Option<String>,
}

/// Telemetry Receiver struct
pub struct Receiver<T, C>
where
    T: PayloadSerialize + Send + Sync + 'static,
    C: ManagedClient + Clone + Send + Sync + 'static,
    C::PubReceiver: Send + Sync + 'static,
{
    application_hlc: Arc<ApplicationHybridLogicalClock>,
    mqtt_client: C,
    mqtt_receiver: C::PubReceiver,
    telemetry_topic: String,
    topic_pattern: TopicPattern,
    message_payload_type: PhantomData<T>,
    receiver_state: State,
    receiver_cancellation_token: CancellationToken,
    auto_ack: bool,
}

#[derive(PartialEq)]
enum State {
    New,
    Subscribed,
    ShutdownSuccessful,
}

impl<T, C> Receiver<T, C>
where
    T: PayloadSerialize + Send + Sync + 'static,
    C: ManagedClient + Clone + Send + Sync + 'static,
    C::PubReceiver: Send + Sync + 'static,
{
    /// Creates a new [`Receiver`].
    ///
    /// # Errors
    /// [`AIOProtocolError`] of kind
    /// [`ConfigurationInvalid`](crate::common::aio_protocol_error::AIOProtocolErrorKind::ConfigurationInvalid)
    /// if the topic pattern, namespace, or token map is invalid.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(
        application_context: ApplicationContext,
        client: C,
        receiver_options: Options,
    ) -> Result<Self, AIOProtocolError> {
        let topic_pattern = TopicPattern::new(
            &receiver_options.topic_pattern,
            receiver_options.topic_namespace.as_deref(),
            &receiver_options.topic_token_map,
        )?;

        let telemetry_topic = topic_pattern.as_subscribe_topic();

        let mqtt_receiver = client.create_filtered_pub_receiver(&telemetry_topic).map_err(|e| {
            AIOProtocolError::new_configuration_invalid_error(
                Some(Box::new(e)),
                "topic_pattern",
                Value::String(telemetry_topic.clone()),
                Some("Could not parse subscription topic pattern".to_string()),
                None,
            )
        })?;

        Ok(Self {
            application_hlc: application_context.application_hlc,
            mqtt_client: client,
            mqtt_receiver,
            telemetry_topic,
            topic_pattern,
            message_payload_type: PhantomData,
            receiver_state: State::New,
            receiver_cancellation_token: CancellationToken::new(),
            auto_ack: receiver_options.auto_ack,
        })
    }

    /// Shuts down the [`Receiver`], unsubscribing from the telemetry topic if subscribed.
    ///
    /// # Errors
    /// [`AIOProtocolError`] of kind
    /// [`MqttError`](crate::common::aio_protocol_error::AIOProtocolErrorKind::MqttError) if the
    /// unsubscribe fails.
    pub async fn shutdown(&mut self) -> Result<(), AIOProtocolError> {
        self.mqtt_receiver.close();

        match self.receiver_state {
            State::New | State::ShutdownSuccessful => {
                self.receiver_state = State::ShutdownSuccessful;
            }
            State::Subscribed => {
                let unsubscribe_result = self.mqtt_client.unsubscribe(&self.telemetry_topic).await;
                match unsubscribe_result {
                    Ok(unsub_ct) => match unsub_ct.await {
                        Ok(()) => self.receiver_state = State::ShutdownSuccessful,
                        Err(e) => {
                            log::error!("Unsuback error: {e}");
                            return Err(AIOProtocolError::new_mqtt_error(
                                Some("MQTT error on telemetry receiver unsuback".to_string()),
                                Box::new(e),
                                None,
                            ));
                        }
                    },
                    Err(e) => {
                        log::error!("Client error while unsubscribing: {e}");
                        return Err(AIOProtocolError::new_mqtt_error(
                            Some("Client error on telemetry receiver unsubscribe".to_string()),
                            Box::new(e),
                            None,
                        ));
                    }
                }
            }
        }
        log::info!("Telemetry receiver shutdown");
        Ok(())
    }

    async fn try_subscribe(&mut self) -> Result<(), AIOProtocolError> {
        let subscribe_result = self.mqtt_client.subscribe(&self.telemetry_topic, QoS::AtLeastOnce).await;
        match subscribe_result {
            Ok(sub_ct) => match sub_ct.await {
                Ok(()) => {}
                Err(e) => {
                    log::error!("Suback error: {e}");
                    return Err(AIOProtocolError::new_mqtt_error(
                        Some("MQTT error on telemetry receiver suback".to_string()),
                        Box::new(e),
                        None,
                    ));
                }
            },
            Err(e) => {
                log::error!("Client error while subscribing: {e}");
                return Err(AIOProtocolError::new_mqtt_error(
                    Some("Client error on telemetry receiver subscribe".to_string()),
                    Box::new(e),
                    None,
                ));
            }
        }
        Ok(())
    }

    /// Receives a telemetry message or [`None`] if there will be no more messages.
    ///
    /// A received message can be acknowledged via the returned [`AckToken`] by calling
    /// [`AckToken::ack`] or dropping the token. Will subscribe on first call if not already
    /// subscribed.
    pub async fn recv(&mut self) -> Option<Result<(Message<T>, Option<AckToken>), AIOProtocolError>> {
        if self.receiver_state == State::New {
            if let Err(e) = self.try_subscribe().await {
                return Some(Err(e));
            }
            self.receiver_state = State::Subscribed;
        }

        loop {
            match self.mqtt_receiver.recv_manual_ack().await {
                Some((m, mut ack_token)) => {
                    if self.auto_ack {
                        ack_token.take();
                    }

                    let pkid = m.pkid;
                    log::info!("[pkid: {pkid}] Received message");

                    match TryInto::<Message<T>>::try_into(m) {
                        Ok(mut message) => {
                            message.topic_tokens.extend(self.topic_pattern.parse_tokens(&message.topic));

                            if let Some(hlc) = &message.timestamp {
                                if let Err(e) = self.application_hlc.update(hlc) {
                                    log::error!(
                                        "[pkid: {pkid}]: Failure updating application HLC against {hlc}: {e}"
                                    );
                                }
                            }
                            return Some(Ok((message, ack_token)));
                        }
                        Err(e_string) => {
                            log::error!("[pkid: {pkid}] {e_string}");

                            // Ack on error to prevent redelivery; the sender will never see a
                            // response regardless, so there is nothing to retry for.
                            if let Some(ack_token) = ack_token {
                                tokio::spawn({
                                    let receiver_cancellation_token_clone =
                                        self.receiver_cancellation_token.clone();
                                    async move {
                                        tokio::select! {
                                            () = receiver_cancellation_token_clone.cancelled() => {},
                                            ack_res = ack_token.ack() => {
                                                if let Err(e) = ack_res {
                                                    log::error!("[pkid: {pkid}] Ack error {e}");
                                                }
                                            }
                                        }
                                    }
                                });
                            }
                        }
                    }
                }
                None => return None,
            }
        }
    }
}

impl<T, C> Drop for Receiver<T, C>
where
    T: PayloadSerialize + Send + Sync + 'static,
    C: ManagedClient + Clone + Send + Sync + 'static,
    C::PubReceiver: Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.receiver_cancellation_token.cancel();
        self.mqtt_receiver.close();

        if State::Subscribed == self.receiver_state {
            tokio::spawn({
                let telemetry_topic = self.telemetry_topic.clone();
                let mqtt_client = self.mqtt_client.clone();
                async move {
                    match mqtt_client.unsubscribe(telemetry_topic.clone()).await {
                        Ok(_) => {
                            log::debug!(
                                "Unsubscribe sent on topic {telemetry_topic}. Unsuback may still be pending."
                            );
                        }
                        Err(e) => {
                            log::error!("Unsubscribe error on topic {telemetry_topic}: {e}");
                        }
                    }
                }
            });
        }

        log::info!("Telemetry receiver dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        application::ApplicationContextBuilder,
        common::{aio_protocol_error::AIOProtocolErrorKind, payload_serialize::MockPayload},
        mqtt::mock::MockClient,
        telemetry::receiver::{OptionsBuilder, Receiver},
    };
    use test_case::test_case;

    fn create_topic_tokens() -> HashMap<String, String> {
        HashMap::from([("telemetryName".to_string(), "test_telemetry".to_string())])
    }

    #[test]
    fn test_new_defaults() {
        let client = MockClient::new("test_server");
        let receiver_options = OptionsBuilder::default().topic_pattern("test/receiver").build().unwrap();

        Receiver::<MockPayload, _>::new(
            ApplicationContextBuilder::default().build().unwrap(),
            client,
            receiver_options,
        )
        .unwrap();
    }

    #[test]
    fn test_new_override_defaults() {
        let client = MockClient::new("test_server");
        let receiver_options = OptionsBuilder::default()
            .topic_pattern("test/{telemetryName}/receiver")
            .topic_namespace("test_namespace")
            .topic_token_map(create_topic_tokens())
            .build()
            .unwrap();

        Receiver::<MockPayload, _>::new(
            ApplicationContextBuilder::default().build().unwrap(),
            client,
            receiver_options,
        )
        .unwrap();
    }

    #[test_case(""; "new_empty_topic_pattern")]
    #[test_case(" "; "new_whitespace_topic_pattern")]
    fn test_new_empty_topic_pattern(topic_pattern: &str) {
        let client = MockClient::new("test_server");
        let receiver_options = OptionsBuilder::default().topic_pattern(topic_pattern).build().unwrap();

        let result: Result<Receiver<MockPayload, _>, _> =
            Receiver::new(ApplicationContextBuilder::default().build().unwrap(), client, receiver_options);
        match result {
            Ok(_) => panic!("Expected error"),
            Err(e) => {
                assert_eq!(e.kind, AIOProtocolErrorKind::ConfigurationInvalid);
                assert!(e.is_shallow);
                assert!(!e.is_remote);
                assert_eq!(e.property_name, Some("pattern".to_string()));
                assert_eq!(e.property_value, Some(Value::String(topic_pattern.to_string())));
            }
        }
    }

    #[tokio::test]
    async fn test_shutdown_without_subscribe() {
        let client = MockClient::new("test_server");
        let receiver_options = OptionsBuilder::default().topic_pattern("test/receiver").build().unwrap();

        let mut receiver: Receiver<MockPayload, _> = Receiver::new(
            ApplicationContextBuilder::default().build().unwrap(),
            client,
            receiver_options,
        )
        .unwrap();
        assert!(receiver.shutdown().await.is_ok());
    }
}
