// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Publishes command requests and correlates inbound responses back to the caller awaiting
//! them.
//!
//! Unlike a telemetry receiver, which has no notion of who is listening, an invoker keyed on
//! MQTT correlation data: a single background task drains the invoker's private response
//! subscription and hands each inbound response to whichever in-flight [`invoke`](Invoker::invoke)
//! call registered that correlation id, via a one-shot channel. There is no broadcast to
//! uninterested callers and no polling.
//!
//! Subscription to the response topic is deferred until the first [`invoke`](Invoker::invoke)
//! call rather than done in [`new`](Invoker::new).

use std::{collections::HashMap, marker::PhantomData, str::FromStr, sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::sync::{oneshot, Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    application::{ApplicationContext, ApplicationHybridLogicalClock},
    common::{
        aio_protocol_error::{AIOProtocolError, Value},
        hybrid_logical_clock::HybridLogicalClock,
        payload_serialize::{FormatIndicator, PayloadSerialize},
        protocol_version::ProtocolVersion,
        token_map::MergedTokenMap,
        topic_processor::TopicPattern,
        user_properties::{validate_custom_user_data, UserProperty},
    },
    mqtt::{
        control_packet::{Publish, PublishProperties, QoS},
        interface::{ManagedClient, MqttPubSub, PubReceiver},
    },
    rpc_command::{
        invalid_status_code_error, supported_protocol_major_versions_to_string, StatusCode,
        DEFAULT_RPC_COMMAND_PROTOCOL_VERSION, RPC_COMMAND_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
    },
};

/// A command request, ready to send via [`Invoker::invoke`].
#[derive(Builder, Clone, Debug)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct Request<TReq: PayloadSerialize> {
    /// The request payload.
    payload: TReq,
    /// Custom MQTT user properties to attach, in addition to this crate's reserved ones.
    #[builder(default)]
    custom_user_data: Vec<(String, String)>,
    /// A fencing token used by the executor to order this request against concurrent writers
    /// of the same resource.
    #[builder(default = "None")]
    fencing_token: Option<HybridLogicalClock>,
    /// Transient topic tokens for this call's request/response topics, e.g. `{executorId}`.
    #[builder(default)]
    topic_tokens: HashMap<String, String>,
    /// How long to wait for a response before failing with
    /// [`Timeout`](crate::common::aio_protocol_error::AIOProtocolErrorKind::Timeout). Also sent
    /// as the request's message expiry interval, so the executor can tell when a late response
    /// is no longer useful.
    timeout: Duration,
}

impl<TReq: PayloadSerialize> RequestBuilder<TReq> {
    fn validate(&self) -> Result<(), String> {
        if let Some(custom_user_data) = &self.custom_user_data {
            validate_custom_user_data(custom_user_data).map_err(|e| e.to_string())?;
        }
        if let Some(timeout) = &self.timeout {
            if timeout.as_millis() == 0 {
                return Err("timeout must be at least 1ms".to_string());
            }
            if u32::try_from(timeout.as_secs()).is_err() {
                return Err("timeout in seconds must fit in a u32 message expiry interval".to_string());
            }
        }
        Ok(())
    }
}

/// A command response, as returned by [`Invoker::invoke`].
#[derive(Debug)]
pub struct Response<TResp: PayloadSerialize> {
    /// The deserialized response payload.
    pub payload: TResp,
    /// Custom MQTT user properties the executor attached to the response.
    pub custom_user_data: Vec<(String, String)>,
    /// The executor's Hybrid Logical Clock timestamp at the time it produced the response.
    pub timestamp: Option<HybridLogicalClock>,
}

/// Command Invoker Options.
#[derive(Builder, Clone)]
#[builder(setter(into, strip_option))]
pub struct Options {
    /// Templated request topic, e.g. `"rpc/{modelId}/{commandName}"`.
    request_topic_pattern: String,
    /// Templated response topic. Defaults to `"{request_topic_pattern}/response"`.
    #[builder(default = "None")]
    response_topic_pattern: Option<String>,
    /// The command's name. Bound into the topic patterns as `{commandName}`.
    command_name: String,
    /// Bound into the topic patterns as `{modelId}`, if present.
    #[builder(default = "None")]
    model_id: Option<String>,
    /// Optional topic namespace prepended to both topic patterns.
    #[builder(default = "None")]
    topic_namespace: Option<String>,
    /// Resident topic tokens shared by every call made through this invoker.
    #[builder(default)]
    topic_token_map: HashMap<String, String>,
    /// Prepended to the response topic pattern, scoping responses to this invoker instance.
    /// Must resolve to a topic only this invoker subscribes to.
    #[builder(default = "Some(\"clients/{invokerClientId}\".to_string())")]
    response_topic_prefix: Option<String>,
    /// Appended to the response topic pattern.
    #[builder(default = "None")]
    response_topic_suffix: Option<String>,
}

struct PendingResponse {
    tx: oneshot::Sender<Publish>,
}

/// Command Invoker.
pub struct Invoker<TReq, TResp, C>
where
    TReq: PayloadSerialize + Send + Sync + 'static,
    TResp: PayloadSerialize + Send + Sync + 'static,
    C: ManagedClient + MqttPubSub + Clone + Send + Sync + 'static,
    C::PubReceiver: Send + 'static,
{
    mqtt_client: C,
    command_name: String,
    application_hlc: Arc<ApplicationHybridLogicalClock>,
    request_topic_pattern: TopicPattern,
    response_topic: String,
    pending: Arc<Mutex<HashMap<Bytes, PendingResponse>>>,
    recv_cancellation_token: CancellationToken,
    subscribed: OnceCell<()>,
    request_payload_type: PhantomData<TReq>,
    response_payload_type: PhantomData<TResp>,
}

impl<TReq, TResp, C> Invoker<TReq, TResp, C>
where
    TReq: PayloadSerialize + Send + Sync + 'static,
    TResp: PayloadSerialize + Send + Sync + 'static,
    C: ManagedClient + MqttPubSub + Clone + Send + Sync + 'static,
    C::PubReceiver: Send + 'static,
{
    /// Creates a new [`Invoker`]. Subscription to its private response topic is deferred to the
    /// first [`invoke`](Invoker::invoke) call.
    ///
    /// # Errors
    /// [`AIOProtocolError`] of kind
    /// [`ConfigurationInvalid`](crate::common::aio_protocol_error::AIOProtocolErrorKind::ConfigurationInvalid)
    /// if a topic pattern, namespace, or token map is invalid.
    pub fn new(
        application_context: ApplicationContext,
        client: C,
        invoker_options: Options,
    ) -> Result<Self, AIOProtocolError> {
        let mut token_map = invoker_options.topic_token_map.clone();
        token_map.insert("commandName".to_string(), invoker_options.command_name.clone());
        if let Some(model_id) = &invoker_options.model_id {
            token_map.insert("modelId".to_string(), model_id.clone());
        }
        token_map.insert("invokerClientId".to_string(), client.client_id().to_string());

        let request_topic_pattern = TopicPattern::new(
            &invoker_options.request_topic_pattern,
            invoker_options.topic_namespace.as_deref(),
            &token_map,
        )?;

        let mut response_pattern = invoker_options
            .response_topic_pattern
            .unwrap_or_else(|| format!("{}/response", invoker_options.request_topic_pattern));
        if let Some(prefix) = &invoker_options.response_topic_prefix {
            response_pattern = format!("{prefix}/{response_pattern}");
        }
        if let Some(suffix) = &invoker_options.response_topic_suffix {
            response_pattern = format!("{response_pattern}/{suffix}");
        }
        let response_topic_pattern = TopicPattern::new(
            &response_pattern,
            invoker_options.topic_namespace.as_deref(),
            &token_map,
        )?;
        let response_topic = response_topic_pattern.as_publish_topic(&token_map)?;

        let pending: Arc<Mutex<HashMap<Bytes, PendingResponse>>> = Arc::new(Mutex::new(HashMap::new()));
        let recv_cancellation_token = CancellationToken::new();

        Ok(Self {
            mqtt_client: client,
            command_name: invoker_options.command_name,
            application_hlc: application_context.application_hlc,
            request_topic_pattern,
            response_topic,
            pending,
            recv_cancellation_token,
            subscribed: OnceCell::new(),
            request_payload_type: PhantomData,
            response_payload_type: PhantomData,
        })
    }

    /// Subscribes to the response topic and starts the background receive loop, if this is the
    /// first call. Concurrent callers all await the same subscribe attempt.
    async fn ensure_subscribed(&self) -> Result<(), AIOProtocolError> {
        self.subscribed
            .get_or_try_init(|| async {
                let mqtt_receiver = self.mqtt_client.create_filtered_pub_receiver(&self.response_topic).map_err(|e| {
                    AIOProtocolError::new_configuration_invalid_error(
                        Some(Box::new(e)),
                        "response_topic_pattern",
                        Value::String(self.response_topic.clone()),
                        Some("Could not subscribe to response topic".to_string()),
                        Some(self.command_name.clone()),
                    )
                })?;

                let subscribe_result = self.mqtt_client.subscribe(self.response_topic.clone(), QoS::AtLeastOnce).await;
                match subscribe_result {
                    Ok(sub_ct) => sub_ct.await.map_err(|e| {
                        AIOProtocolError::new_mqtt_error(
                            Some("MQTT error on command invoker suback".to_string()),
                            Box::new(e),
                            Some(self.command_name.clone()),
                        )
                    })?,
                    Err(e) => {
                        return Err(AIOProtocolError::new_mqtt_error(
                            Some("Client error on command invoker subscribe".to_string()),
                            Box::new(e),
                            Some(self.command_name.clone()),
                        ));
                    }
                }

                tokio::spawn(Self::recv_loop(
                    mqtt_receiver,
                    Arc::clone(&self.pending),
                    self.recv_cancellation_token.clone(),
                ));

                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn recv_loop(
        mut mqtt_receiver: C::PubReceiver,
        pending: Arc<Mutex<HashMap<Bytes, PendingResponse>>>,
        cancellation_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancellation_token.cancelled() => return,
                received = mqtt_receiver.recv_manual_ack() => {
                    let Some((publish, ack_token)) = received else { return };
                    if let Some(correlation_data) = publish
                        .properties
                        .as_ref()
                        .and_then(|p| p.correlation_data.clone())
                    {
                        if let Some(pending_response) = pending.lock().await.remove(&correlation_data) {
                            let _ = pending_response.tx.send(publish);
                        } else {
                            log::warn!("Received response with no matching in-flight request; discarding");
                        }
                    } else {
                        log::warn!("Received response with no correlation data; discarding");
                    }
                    if let Some(ack_token) = ack_token {
                        if let Err(e) = ack_token.ack().await {
                            log::error!("Ack error on command response: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Sends `request` and awaits its response.
    ///
    /// # Errors
    /// [`AIOProtocolError`] of kind
    /// [`Timeout`](crate::common::aio_protocol_error::AIOProtocolErrorKind::Timeout) if no
    /// response arrives within `request.timeout`.
    ///
    /// [`AIOProtocolError`] of kind
    /// [`ExecutionException`](crate::common::aio_protocol_error::AIOProtocolErrorKind::ExecutionException)
    /// if the executor reports an application-level failure.
    ///
    /// Other [`AIOProtocolError`] kinds for malformed requests, unsupported protocol versions,
    /// or transport failures.
    pub async fn invoke(&self, request: Request<TReq>) -> Result<Response<TResp>, AIOProtocolError> {
        self.ensure_subscribed().await?;

        let serialized_payload = request
            .payload
            .serialize()
            .map_err(|e| AIOProtocolError::new_payload_invalid_error(Some(e.into()), None))?;

        let empty_resident = HashMap::new();
        let merged_tokens = MergedTokenMap::new(&empty_resident, &request.topic_tokens).to_owned_map();
        let request_topic = self.request_topic_pattern.as_publish_topic(&merged_tokens)?;

        let correlation_uuid = Uuid::new_v4();
        let correlation_data = Bytes::copy_from_slice(correlation_uuid.as_bytes());
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(correlation_data.clone(), PendingResponse { tx });

        let mut user_properties = vec![
            (UserProperty::ProtocolVersion.to_string(), RPC_COMMAND_PROTOCOL_VERSION.to_string()),
            (UserProperty::SourceId.to_string(), self.mqtt_client.client_id().to_string()),
            (
                UserProperty::SupportedMajorVersions.to_string(),
                supported_protocol_major_versions_to_string(SUPPORTED_PROTOCOL_VERSIONS),
            ),
        ];
        if let Ok(timestamp) = self.application_hlc.update_now() {
            user_properties.push((UserProperty::Timestamp.to_string(), timestamp));
        }
        if let Some(fencing_token) = &request.fencing_token {
            user_properties.push((UserProperty::FencingToken.to_string(), fencing_token.to_string()));
        }
        user_properties.extend(request.custom_user_data);

        let properties = PublishProperties {
            correlation_data: Some(correlation_data.clone()),
            response_topic: Some(self.response_topic.clone()),
            content_type: Some(TReq::content_type().to_string()),
            payload_format_indicator: TReq::format_indicator() as u8,
            message_expiry_interval: Some(u32::try_from(request.timeout.as_secs()).unwrap_or(u32::MAX)),
            user_properties,
        };

        let publish_result = self
            .mqtt_client
            .publish(request_topic, QoS::AtLeastOnce, false, serialized_payload, Some(properties))
            .await;

        match publish_result {
            Ok(completion_token) => {
                if let Err(e) = completion_token.await {
                    self.pending.lock().await.remove(&correlation_data);
                    return Err(AIOProtocolError::new_mqtt_error(
                        Some("MQTT error on command invoker puback".to_string()),
                        Box::new(e),
                        Some(self.command_name.clone()),
                    ));
                }
            }
            Err(e) => {
                self.pending.lock().await.remove(&correlation_data);
                return Err(AIOProtocolError::new_mqtt_error(
                    Some("Client error on command invoker publish".to_string()),
                    Box::new(e),
                    Some(self.command_name.clone()),
                ));
            }
        }

        let response_publish = match tokio::time::timeout(request.timeout, rx).await {
            Ok(Ok(publish)) => publish,
            Ok(Err(_)) => {
                return Err(AIOProtocolError::new_cancellation_error(
                    Some(self.command_name.clone()),
                    Some(correlation_uuid.to_string()),
                ));
            }
            Err(_) => {
                self.pending.lock().await.remove(&correlation_data);
                return Err(AIOProtocolError::new_timeout_error(
                    "timeout",
                    request.timeout,
                    Some(correlation_uuid.to_string()),
                    Some(self.command_name.clone()),
                ));
            }
        };

        self.parse_response(response_publish)
    }

    fn parse_response(&self, publish: Publish) -> Result<Response<TResp>, AIOProtocolError> {
        let properties = publish.properties.ok_or_else(|| {
            AIOProtocolError::new_header_missing_error("properties", true)
        })?;

        let mut aio_data: HashMap<UserProperty, String> = HashMap::new();
        let mut custom_user_data = vec![];
        for (key, value) in properties.user_properties {
            match UserProperty::from_str(&key) {
                Ok(p) => {
                    aio_data.insert(p, value);
                }
                Err(()) => custom_user_data.push((key, value)),
            }
        }

        let protocol_version = aio_data
            .get(&UserProperty::ProtocolVersion)
            .and_then(|v| ProtocolVersion::parse_protocol_version(v))
            .unwrap_or(DEFAULT_RPC_COMMAND_PROTOCOL_VERSION);
        if !protocol_version.is_supported(SUPPORTED_PROTOCOL_VERSIONS) {
            return Err(AIOProtocolError::new_unsupported_version_error(
                Some(self.command_name.clone()),
                SUPPORTED_PROTOCOL_VERSIONS,
                &protocol_version.to_string(),
            ));
        }

        let status_value = aio_data
            .get(&UserProperty::Status)
            .ok_or_else(|| AIOProtocolError::new_header_missing_error("__stat", true))?;
        let status_code: StatusCode = status_value
            .parse::<u16>()
            .ok()
            .and_then(|v| StatusCode::try_from(v).ok())
            .ok_or_else(|| invalid_status_code_error(status_value, Some(self.command_name.clone())))?;

        if !status_code.is_success() {
            let status_message = aio_data.get(&UserProperty::StatusMessage).cloned();
            let is_application_error = aio_data
                .get(&UserProperty::IsApplicationError)
                .is_some_and(|v| v == "true");

            return Err(match status_code {
                StatusCode::VersionNotSupported => AIOProtocolError::new_unsupported_version_error(
                    Some(self.command_name.clone()),
                    SUPPORTED_PROTOCOL_VERSIONS,
                    aio_data.get(&UserProperty::RequestProtocolVersion).map_or("", String::as_str),
                ),
                _ if is_application_error => AIOProtocolError::new_execution_exception(
                    Some(self.command_name.clone()),
                    None,
                    status_message,
                ),
                _ => AIOProtocolError::new_invocation_exception(
                    Some(self.command_name.clone()),
                    None,
                    aio_data.get(&UserProperty::InvalidPropertyName).cloned(),
                    aio_data.get(&UserProperty::InvalidPropertyValue).cloned().map(Value::String),
                    status_message,
                ),
            });
        }

        let timestamp = aio_data
            .get(&UserProperty::Timestamp)
            .map(|s| HybridLogicalClock::from_str(s))
            .transpose()?;
        if let Some(hlc) = &timestamp {
            let _ = self.application_hlc.update(hlc);
        }

        let format_indicator: FormatIndicator = properties
            .payload_format_indicator
            .try_into()
            .unwrap_or(FormatIndicator::UnspecifiedBytes);
        let payload = TResp::deserialize(&publish.payload, properties.content_type.as_ref(), &format_indicator)
            .map_err(|e| AIOProtocolError::new_payload_invalid_error(Some(e.into()), None))?;

        Ok(Response { payload, custom_user_data, timestamp })
    }
}

impl<TReq, TResp, C> Drop for Invoker<TReq, TResp, C>
where
    TReq: PayloadSerialize + Send + Sync + 'static,
    TResp: PayloadSerialize + Send + Sync + 'static,
    C: ManagedClient + MqttPubSub + Clone + Send + Sync + 'static,
    C::PubReceiver: Send + 'static,
{
    fn drop(&mut self) {
        self.recv_cancellation_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        application::ApplicationContextBuilder, common::payload_serialize::MockPayload, mqtt::mock::MockClient,
    };

    fn mock_payload_expectations() {
        let content_type_ctx = MockPayload::content_type_context();
        content_type_ctx.expect().return_const("application/json");
        let format_indicator_ctx = MockPayload::format_indicator_context();
        format_indicator_ctx.expect().return_const(FormatIndicator::UnspecifiedBytes);
    }

    fn request_payload() -> MockPayload {
        let mut payload = MockPayload::new();
        payload.expect_clone().returning(MockPayload::new);
        payload.expect_serialize().returning(|| Ok(b"request".to_vec()));
        payload
    }

    fn new_invoker(client: MockClient) -> Invoker<MockPayload, MockPayload, MockClient> {
        let options = OptionsBuilder::default()
            .request_topic_pattern("rpc/{commandName}")
            .command_name("doThing")
            .build()
            .unwrap();
        Invoker::new(ApplicationContextBuilder::default().build().unwrap(), client, options).unwrap()
    }

    fn find_request_correlation_data(client: &MockClient) -> Bytes {
        client
            .calls()
            .into_iter()
            .find_map(|call| match call {
                crate::mqtt::mock::RecordedCall::Publish(_, _, Some(properties)) => {
                    properties.correlation_data
                }
                _ => None,
            })
            .expect("invoke should have published a request with correlation data")
    }

    #[tokio::test]
    async fn new_does_not_subscribe() {
        let client = MockClient::new("invoker_1");
        let invoker = new_invoker(client.clone());

        assert!(client.calls().is_empty());
        drop(invoker);
    }

    #[tokio::test]
    async fn first_invoke_subscribes_to_its_own_response_topic() {
        let client = MockClient::new("invoker_1");
        let invoker = new_invoker(client.clone());

        invoker.ensure_subscribed().await.unwrap();

        let calls = client.calls();
        assert!(matches!(
            &calls[0],
            crate::mqtt::mock::RecordedCall::Subscribe(t) if t == "clients/invoker_1/rpc/doThing/response"
        ));

        // A second call must not subscribe again.
        invoker.ensure_subscribed().await.unwrap();
        assert_eq!(client.calls().len(), 1);
    }

    #[tokio::test]
    async fn invoke_resolves_on_matching_response() {
        mock_payload_expectations();
        let deserialize_ctx = MockPayload::deserialize_context();
        deserialize_ctx.expect().returning(|_, _, _| Ok(MockPayload::new()));

        let client = MockClient::new("invoker_1");
        let invoker = new_invoker(client.clone());

        let request = RequestBuilder::default()
            .payload(request_payload())
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap();

        let invoker_handle = tokio::spawn(async move { invoker.invoke(request).await });

        let correlation_data = loop {
            if !client.calls().is_empty() {
                break find_request_correlation_data(&client);
            }
            tokio::task::yield_now().await;
        };

        client.push_inbound(Publish {
            topic: Bytes::from_static(b"clients/invoker_1/rpc/doThing/response"),
            payload: Bytes::from_static(b"response"),
            qos: crate::mqtt::control_packet::QoS::AtLeastOnce,
            retain: false,
            pkid: 1,
            properties: Some(PublishProperties {
                correlation_data: Some(correlation_data),
                response_topic: None,
                content_type: Some("application/json".to_string()),
                payload_format_indicator: 0,
                message_expiry_interval: None,
                user_properties: vec![(UserProperty::Status.to_string(), "200".to_string())],
            }),
        });

        let response = invoker_handle.await.unwrap().unwrap();
        assert!(response.timestamp.is_none());
        assert!(response.custom_user_data.is_empty());
    }

    #[tokio::test]
    async fn invoke_times_out_when_no_response_arrives() {
        mock_payload_expectations();

        let client = MockClient::new("invoker_1");
        let invoker = new_invoker(client);

        let request = RequestBuilder::default()
            .payload(request_payload())
            .timeout(Duration::from_millis(20))
            .build()
            .unwrap();

        let err = invoker.invoke(request).await.unwrap_err();
        assert!(matches!(
            err.kind,
            crate::common::aio_protocol_error::AIOProtocolErrorKind::Timeout
        ));
    }

    #[tokio::test]
    async fn invoke_reports_execution_exception_on_application_error_status() {
        mock_payload_expectations();

        let client = MockClient::new("invoker_1");
        let invoker = new_invoker(client.clone());

        let request = RequestBuilder::default()
            .payload(request_payload())
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap();

        let invoker_handle = tokio::spawn(async move { invoker.invoke(request).await });

        let correlation_data = loop {
            if !client.calls().is_empty() {
                break find_request_correlation_data(&client);
            }
            tokio::task::yield_now().await;
        };

        client.push_inbound(Publish {
            topic: Bytes::from_static(b"clients/invoker_1/rpc/doThing/response"),
            payload: Bytes::new(),
            qos: crate::mqtt::control_packet::QoS::AtLeastOnce,
            retain: false,
            pkid: 1,
            properties: Some(PublishProperties {
                correlation_data: Some(correlation_data),
                response_topic: None,
                content_type: None,
                payload_format_indicator: 0,
                message_expiry_interval: None,
                user_properties: vec![
                    (UserProperty::Status.to_string(), "422".to_string()),
                    (UserProperty::IsApplicationError.to_string(), "true".to_string()),
                ],
            }),
        });

        let err = invoker_handle.await.unwrap().unwrap_err();
        assert!(matches!(
            err.kind,
            crate::common::aio_protocol_error::AIOProtocolErrorKind::ExecutionException
        ));
    }
}
