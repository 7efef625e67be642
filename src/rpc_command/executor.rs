// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Serves command requests: subscribes to a request topic, deduplicates and idempotently
//! reuses responses via the [`ResponseCache`](crate::rpc_command::cache::ResponseCache), and
//! bounds how many handlers run concurrently.

use std::{
    collections::{hash_map::DefaultHasher, HashMap},
    hash::{Hash, Hasher},
    marker::PhantomData,
    str::FromStr,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::{
    application::{ApplicationContext, ApplicationHybridLogicalClock},
    common::{
        aio_protocol_error::{AIOProtocolError, Value},
        hybrid_logical_clock::HybridLogicalClock,
        payload_serialize::{FormatIndicator, PayloadSerialize},
        protocol_version::ProtocolVersion,
        topic_processor::TopicPattern,
        user_properties::UserProperty,
    },
    mqtt::{
        control_packet::{Publish, PublishProperties, QoS},
        interface::{AckToken, ManagedClient, MqttPubSub, PubReceiver},
    },
    rpc_command::{
        application_error_headers,
        cache::{CacheKey, CachedResponse, PendingCell, ResponseCache, RetrieveOutcome},
        supported_protocol_major_versions_to_string, DEFAULT_RPC_COMMAND_PROTOCOL_VERSION,
        RPC_COMMAND_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
    },
};

const DEFAULT_MAX_CONCURRENT_EXECUTIONS: usize = 10;

/// How long a successful response stays retrievable for exact-correlation dedup when the
/// executor has no explicit `cacheable_duration` (i.e. the command isn't declared idempotent).
/// Cross-correlation (idempotent) reuse is governed entirely by `cacheable_duration`; this only
/// protects against same-correlation retries arriving in quick succession.
const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(5);

/// Command Executor Options.
#[derive(Builder, Clone)]
#[builder(setter(into, strip_option))]
pub struct Options {
    /// Templated request topic, e.g. `"rpc/{modelId}/{commandName}"`.
    request_topic_pattern: String,
    /// The command's name. Bound into the topic pattern as `{commandName}`.
    command_name: String,
    /// Bound into the topic pattern as `{modelId}`, if present.
    #[builder(default = "None")]
    model_id: Option<String>,
    /// Optional topic namespace prepended to the topic pattern.
    #[builder(default = "None")]
    topic_namespace: Option<String>,
    /// Resident topic tokens.
    #[builder(default)]
    topic_token_map: HashMap<String, String>,
    /// Whether repeated requests with the same payload, from the same invoker, may reuse a
    /// previous response rather than running the handler again.
    #[builder(default = "false")]
    is_idempotent: bool,
    /// How long a response remains eligible for idempotent reuse. Ignored if `is_idempotent` is
    /// false.
    #[builder(default = "None")]
    cacheable_duration: Option<Duration>,
    /// How many handler executions may be outstanding (received but not yet completed) at once.
    #[builder(default = "DEFAULT_MAX_CONCURRENT_EXECUTIONS")]
    max_concurrent_executions: usize,
}

/// A command response, built via [`ResponseBuilder`] and passed to [`Request::complete`].
#[derive(Builder, Clone)]
#[builder(setter(into, strip_option))]
pub struct Response<TResp: PayloadSerialize> {
    /// The payload to return. `None` produces a response with no content
    /// ([`StatusCode::NoContent`]).
    #[builder(default = "None")]
    payload: Option<TResp>,
    /// Custom MQTT user properties to attach to the response, in addition to this crate's
    /// reserved ones.
    #[builder(default)]
    custom_user_data: Vec<(String, String)>,
}

/// A single command invocation, yielded by [`Executor::recv`].
///
/// Consume it with [`Request::complete`] on success or [`Request::fail`] to report an
/// application or protocol-level failure. Dropping a `Request` without completing it leaves the
/// invoker waiting until its own timeout elapses.
pub struct Request<TReq, TResp, C>
where
    TReq: PayloadSerialize,
    TResp: PayloadSerialize + Send + Sync + 'static,
    C: ManagedClient + MqttPubSub + Clone + Send + Sync + 'static,
{
    /// The deserialized request payload.
    pub payload: TReq,
    /// Custom MQTT user properties the invoker attached to the request.
    pub custom_user_data: Vec<(String, String)>,
    /// The invoker's Hybrid Logical Clock timestamp at the time it sent the request, if present.
    pub timestamp: Option<HybridLogicalClock>,
    /// The fencing token attached to the request, if any.
    pub fencing_token: Option<HybridLogicalClock>,
    /// The MQTT client id of the invoker that sent this request.
    pub invoker_id: String,
    /// Topic tokens parsed from the concrete request topic.
    pub topic_tokens: HashMap<String, String>,

    command_name: String,
    mqtt_client: C,
    response_topic: String,
    correlation_data: bytes::Bytes,
    ack_token: Option<AckToken>,
    cache: Option<Arc<ResponseCache>>,
    cache_key: Option<CacheKey>,
    pending_cell: Option<Arc<PendingCell>>,
    request_payload_hash: u64,
    is_idempotent: bool,
    cacheable_duration: Option<Duration>,
    application_hlc: Arc<ApplicationHybridLogicalClock>,
    started_at: Instant,
    request_expiry: Option<Instant>,
    _permit: OwnedSemaphorePermit,
    response_type: PhantomData<TResp>,
}

impl<TReq, TResp, C> Request<TReq, TResp, C>
where
    TReq: PayloadSerialize,
    TResp: PayloadSerialize + Send + Sync + 'static,
    C: ManagedClient + MqttPubSub + Clone + Send + Sync + 'static,
{
    /// Publishes a successful response, caches it if the executor is configured to, and
    /// acknowledges the request.
    ///
    /// # Errors
    /// [`AIOProtocolError`] of kind
    /// [`PayloadInvalid`](crate::common::aio_protocol_error::AIOProtocolErrorKind::PayloadInvalid)
    /// if the response fails to serialize.
    ///
    /// [`AIOProtocolError`] of kind
    /// [`MqttError`](crate::common::aio_protocol_error::AIOProtocolErrorKind::MqttError) if the
    /// publish or its acknowledgement fails.
    pub async fn complete(self, response: Response<TResp>) -> Result<(), AIOProtocolError> {
        let (status_code, payload) = match &response.payload {
            Some(payload) => (
                super::StatusCode::Ok,
                payload
                    .serialize()
                    .map_err(|e| AIOProtocolError::new_payload_invalid_error(Some(e.into()), None))?,
            ),
            None => (super::StatusCode::NoContent, Vec::new()),
        };
        let content_type = response.payload.as_ref().map(|_| TResp::content_type().to_string());
        let format_indicator = response.payload.as_ref().map_or(FormatIndicator::UnspecifiedBytes, |_| {
            TResp::format_indicator()
        });

        let mut headers = vec![(UserProperty::Status.to_string(), (status_code as u16).to_string())];
        headers.extend(response.custom_user_data);

        self.publish_response(status_code, payload, content_type, format_indicator, headers).await
    }

    /// Publishes a failure response and acknowledges the request. Does not populate the cache:
    /// failed invocations are always retried.
    ///
    /// # Errors
    /// [`AIOProtocolError`] of kind
    /// [`MqttError`](crate::common::aio_protocol_error::AIOProtocolErrorKind::MqttError) if the
    /// publish or its acknowledgement fails.
    pub async fn fail(
        self,
        status_code: super::StatusCode,
        message: Option<String>,
        is_application_error: bool,
        app_err_code: Option<String>,
        app_err_payload: Option<String>,
    ) -> Result<(), AIOProtocolError> {
        let mut headers = vec![(UserProperty::Status.to_string(), (status_code as u16).to_string())];
        if let Some(message) = message {
            headers.push((UserProperty::StatusMessage.to_string(), message));
        }
        if is_application_error {
            headers.extend(application_error_headers(app_err_code.as_deref(), app_err_payload.as_deref()));
        }
        if let Some(cache) = &self.cache {
            if let Some(key) = &self.cache_key {
                cache.fail(key);
            }
        }
        self.publish_response(status_code, Vec::new(), None, FormatIndicator::UnspecifiedBytes, headers)
            .await
    }

    /// Remaining seconds before the request's own `message_expiry_interval` elapses, or `None`
    /// if the request carried no expiry or it has already passed.
    fn remaining_expiry_secs(&self) -> Option<u32> {
        let expiry = self.request_expiry?;
        let remaining = expiry.checked_duration_since(Instant::now())?;
        u32::try_from(remaining.as_secs()).ok().filter(|secs| *secs > 0)
    }

    async fn publish_response(
        mut self,
        status_code: super::StatusCode,
        payload: Vec<u8>,
        content_type: Option<String>,
        format_indicator: FormatIndicator,
        mut headers: Vec<(String, String)>,
    ) -> Result<(), AIOProtocolError> {
        if let Ok(timestamp) = self.application_hlc.update_now() {
            headers.push((UserProperty::Timestamp.to_string(), timestamp));
        }
        headers.push((UserProperty::ProtocolVersion.to_string(), RPC_COMMAND_PROTOCOL_VERSION.to_string()));

        let properties = PublishProperties {
            correlation_data: Some(self.correlation_data.clone()),
            response_topic: None,
            content_type: content_type.clone(),
            payload_format_indicator: format_indicator as u8,
            message_expiry_interval: self.remaining_expiry_secs(),
            user_properties: headers.clone(),
        };

        let publish_result = self
            .mqtt_client
            .publish(
                self.response_topic.clone(),
                QoS::AtLeastOnce,
                false,
                payload.clone(),
                Some(properties),
            )
            .await;

        let publish_outcome = match publish_result {
            Ok(completion_token) => completion_token.await.map_err(|e| {
                AIOProtocolError::new_mqtt_error(
                    Some("MQTT error on command executor puback".to_string()),
                    Box::new(e),
                    Some(self.command_name.clone()),
                )
            }),
            Err(e) => Err(AIOProtocolError::new_mqtt_error(
                Some("Client error on command executor publish".to_string()),
                Box::new(e),
                Some(self.command_name.clone()),
            )),
        };

        if let (Ok(()), Some(cache), Some(key)) = (&publish_outcome, &self.cache, &self.cache_key) {
            if status_code.is_success() {
                // Exact-correlation dedup applies to every successful response, idempotent or
                // not: a retry with the same correlation data is the same logical request and
                // must not re-run the handler. `cacheable_duration` only controls how long the
                // response stays eligible for *cross-correlation* (idempotent) reuse; when unset
                // it still gets a short default window so same-correlation retries within that
                // window are deduped, per the dedup-within-TTL requirement.
                let duration = self.cacheable_duration.unwrap_or(DEFAULT_DEDUP_WINDOW);
                cache.store(
                    key.clone(),
                    CachedResponse {
                        payload: bytes::Bytes::from(payload),
                        content_type,
                        user_properties: headers,
                        execution_duration: self.started_at.elapsed(),
                    },
                    self.is_idempotent,
                    self.request_payload_hash,
                    duration,
                    duration / 2,
                );
            } else {
                cache.fail(key);
            }
        }

        // Acknowledge regardless of whether the response published successfully: redelivery
        // would only produce the same outcome, and the invoker's own timeout is the backstop.
        if let Some(ack_token) = self.ack_token.take() {
            if let Err(e) = ack_token.ack().await {
                log::error!("Ack error on command request: {e}");
            }
        }

        publish_outcome
    }
}

impl<TReq, TResp, C> Drop for Request<TReq, TResp, C>
where
    TReq: PayloadSerialize,
    TResp: PayloadSerialize + Send + Sync + 'static,
    C: ManagedClient + MqttPubSub + Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        // A no-op if `complete`/`fail` already resolved this request's cache entry: `fail` only
        // acts on a key still registered as pending.
        if let (Some(cache), Some(key)) = (&self.cache, &self.cache_key) {
            cache.fail(key);
        }
        if let Some(cell) = &self.pending_cell {
            cell.cancellation_token.cancel();
        }
    }
}

/// Command Executor.
pub struct Executor<TReq, TResp, C>
where
    TReq: PayloadSerialize + Send + Sync + 'static,
    TResp: PayloadSerialize + Send + Sync + 'static,
    C: ManagedClient + MqttPubSub + Clone + Send + Sync + 'static,
{
    mqtt_client: C,
    mqtt_receiver: C::PubReceiver,
    command_name: String,
    request_topic_pattern: TopicPattern,
    application_hlc: Arc<ApplicationHybridLogicalClock>,
    cache: Option<Arc<ResponseCache>>,
    is_idempotent: bool,
    cacheable_duration: Option<Duration>,
    concurrency: Arc<Semaphore>,
    request_type: PhantomData<TReq>,
    response_type: PhantomData<TResp>,
}

impl<TReq, TResp, C> Executor<TReq, TResp, C>
where
    TReq: PayloadSerialize + Send + Sync + 'static,
    TResp: PayloadSerialize + Send + Sync + 'static,
    C: ManagedClient + MqttPubSub + Clone + Send + Sync + 'static,
{
    /// Creates a new [`Executor`], subscribing to its request topic.
    ///
    /// `cache` is shared across every executor that should see each other's cached responses;
    /// pass `None` to disable caching entirely even if `executor_options.is_idempotent` is set.
    ///
    /// # Errors
    /// [`AIOProtocolError`] of kind
    /// [`ConfigurationInvalid`](crate::common::aio_protocol_error::AIOProtocolErrorKind::ConfigurationInvalid)
    /// if the topic pattern, namespace, or token map is invalid.
    pub async fn new(
        application_context: ApplicationContext,
        client: C,
        executor_options: Options,
        cache: Option<Arc<ResponseCache>>,
    ) -> Result<Self, AIOProtocolError> {
        let mut token_map = executor_options.topic_token_map.clone();
        token_map.insert("commandName".to_string(), executor_options.command_name.clone());
        if let Some(model_id) = &executor_options.model_id {
            token_map.insert("modelId".to_string(), model_id.clone());
        }

        let request_topic_pattern = TopicPattern::new(
            &executor_options.request_topic_pattern,
            executor_options.topic_namespace.as_deref(),
            &token_map,
        )?;
        let subscribe_topic = request_topic_pattern.as_subscribe_topic();

        let mqtt_receiver = client.create_filtered_pub_receiver(&subscribe_topic).map_err(|e| {
            AIOProtocolError::new_configuration_invalid_error(
                Some(Box::new(e)),
                "request_topic_pattern",
                Value::String(subscribe_topic.clone()),
                Some("Could not subscribe to request topic".to_string()),
                Some(executor_options.command_name.clone()),
            )
        })?;

        let subscribe_result = client.subscribe(subscribe_topic.clone(), QoS::AtLeastOnce).await;
        match subscribe_result {
            Ok(sub_ct) => sub_ct.await.map_err(|e| {
                AIOProtocolError::new_mqtt_error(
                    Some("MQTT error on command executor suback".to_string()),
                    Box::new(e),
                    Some(executor_options.command_name.clone()),
                )
            })?,
            Err(e) => {
                return Err(AIOProtocolError::new_mqtt_error(
                    Some("Client error on command executor subscribe".to_string()),
                    Box::new(e),
                    Some(executor_options.command_name.clone()),
                ));
            }
        }

        Ok(Self {
            mqtt_client: client,
            mqtt_receiver,
            command_name: executor_options.command_name,
            request_topic_pattern,
            application_hlc: application_context.application_hlc,
            cache,
            is_idempotent: executor_options.is_idempotent,
            cacheable_duration: executor_options.cacheable_duration,
            concurrency: Arc::new(Semaphore::new(executor_options.max_concurrent_executions)),
            request_type: PhantomData,
            response_type: PhantomData,
        })
    }

    /// Waits for the next command request, transparently serving dedup/idempotent cache hits
    /// without involving the caller. Returns `None` once the underlying subscription closes.
    pub async fn recv(&mut self) -> Option<Request<TReq, TResp, C>> {
        loop {
            let (publish, ack_token) = self.mqtt_receiver.recv_manual_ack().await?;
            match self.handle_publish(publish, ack_token).await {
                Some(request) => return Some(request),
                None => continue,
            }
        }
    }

    async fn handle_publish(
        &self,
        publish: Publish,
        ack_token: Option<AckToken>,
    ) -> Option<Request<TReq, TResp, C>> {
        let Some(properties) = publish.properties.clone() else {
            log::warn!("Received command request with no MQTT properties; discarding");
            return None;
        };
        let Some(correlation_data) = properties.correlation_data.clone() else {
            log::warn!("Received command request with no correlation data; discarding");
            return None;
        };
        let Some(response_topic) = properties.response_topic.clone() else {
            log::warn!("Received command request with no response topic; discarding");
            return None;
        };
        // The broker, not this crate, enforces expiry, but a response crafted after the
        // request's own expiry has elapsed is still worth publishing: it may still reach the
        // invoker if the broker's clock lags, and the cache already stored it. `None` here
        // simply omits the header rather than drops the response.
        let request_expiry = properties
            .message_expiry_interval
            .map(|secs| Instant::now() + Duration::from_secs(u64::from(secs)));

        let mut aio_data: HashMap<UserProperty, String> = HashMap::new();
        let mut custom_user_data = vec![];
        for (key, value) in &properties.user_properties {
            match UserProperty::from_str(key) {
                Ok(p) => {
                    aio_data.insert(p, value.clone());
                }
                Err(()) => custom_user_data.push((key.clone(), value.clone())),
            }
        }

        let invoker_id = aio_data.get(&UserProperty::SourceId).cloned().unwrap_or_default();
        let topic = String::from_utf8_lossy(&publish.topic).to_string();
        let topic_tokens = self.request_topic_pattern.parse_tokens(&topic);

        let permit = match Arc::clone(&self.concurrency).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return None,
        };

        let protocol_version = aio_data
            .get(&UserProperty::ProtocolVersion)
            .and_then(|v| ProtocolVersion::parse_protocol_version(v))
            .unwrap_or(DEFAULT_RPC_COMMAND_PROTOCOL_VERSION);

        let cache_key = CacheKey {
            command_name: self.command_name.clone(),
            invoker_id: invoker_id.clone(),
            correlation_data: correlation_data.clone(),
        };

        if !protocol_version.is_supported(SUPPORTED_PROTOCOL_VERSIONS) {
            self.reject(
                &response_topic,
                &correlation_data,
                super::StatusCode::VersionNotSupported,
                format!(
                    "Unsupported protocol version '{protocol_version}'. Supported major versions: {}",
                    supported_protocol_major_versions_to_string(SUPPORTED_PROTOCOL_VERSIONS)
                ),
                ack_token,
            )
            .await;
            return None;
        }

        let format_indicator: FormatIndicator =
            properties.payload_format_indicator.try_into().unwrap_or(FormatIndicator::UnspecifiedBytes);
        let request_payload_hash = Self::hash_payload(&publish.payload);
        let payload = match TReq::deserialize(&publish.payload, properties.content_type.as_ref(), &format_indicator)
        {
            Ok(payload) => payload,
            Err(e) => {
                self.reject(
                    &response_topic,
                    &correlation_data,
                    super::StatusCode::BadRequest,
                    format!("Failed to deserialize request payload: {e:?}"),
                    ack_token,
                )
                .await;
                return None;
            }
        };

        let timestamp = match aio_data.get(&UserProperty::Timestamp).map(|s| HybridLogicalClock::from_str(s)) {
            Some(Ok(hlc)) => {
                let _ = self.application_hlc.update(&hlc);
                Some(hlc)
            }
            Some(Err(e)) => {
                self.reject(
                    &response_topic,
                    &correlation_data,
                    super::StatusCode::BadRequest,
                    format!("{e}"),
                    ack_token,
                )
                .await;
                return None;
            }
            None => None,
        };

        let fencing_token = match aio_data.get(&UserProperty::FencingToken).map(|s| HybridLogicalClock::from_str(s))
        {
            Some(Ok(hlc)) => Some(hlc),
            Some(Err(_)) | None => None,
        };

        let idempotent_hash = self.is_idempotent.then_some(request_payload_hash);
        if let Some(cache) = &self.cache {
            match cache.retrieve(&cache_key, idempotent_hash) {
                RetrieveOutcome::Hit(cached) => {
                    self.replay_cached(&response_topic, &correlation_data, cached, ack_token).await;
                    return None;
                }
                RetrieveOutcome::Pending(cell) => {
                    let cached = cell.wait().await;
                    match cached {
                        Some(cached) => {
                            self.replay_cached(&response_topic, &correlation_data, cached, ack_token).await;
                        }
                        None => {
                            if let Some(ack_token) = ack_token {
                                let _ = ack_token.ack().await;
                            }
                        }
                    }
                    return None;
                }
                RetrieveOutcome::Miss(cell) => {
                    return Some(Request {
                        payload,
                        custom_user_data,
                        timestamp,
                        fencing_token,
                        invoker_id,
                        topic_tokens,
                        command_name: self.command_name.clone(),
                        mqtt_client: self.mqtt_client.clone(),
                        response_topic,
                        correlation_data,
                        ack_token,
                        cache: Some(Arc::clone(cache)),
                        cache_key: Some(cache_key),
                        pending_cell: Some(cell),
                        request_payload_hash,
                        is_idempotent: self.is_idempotent,
                        cacheable_duration: self.cacheable_duration,
                        application_hlc: Arc::clone(&self.application_hlc),
                        started_at: Instant::now(),
                        request_expiry,
                        _permit: permit,
                        response_type: PhantomData,
                    });
                }
            }
        }

        Some(Request {
            payload,
            custom_user_data,
            timestamp,
            fencing_token,
            invoker_id,
            topic_tokens,
            command_name: self.command_name.clone(),
            mqtt_client: self.mqtt_client.clone(),
            response_topic,
            correlation_data,
            ack_token,
            cache: None,
            cache_key: None,
            pending_cell: None,
            request_payload_hash,
            is_idempotent: self.is_idempotent,
            cacheable_duration: self.cacheable_duration,
            application_hlc: Arc::clone(&self.application_hlc),
            started_at: Instant::now(),
            request_expiry,
            _permit: permit,
            response_type: PhantomData,
        })
    }

    fn hash_payload(payload: &[u8]) -> u64 {
        let mut hasher = DefaultHasher::new();
        payload.hash(&mut hasher);
        hasher.finish()
    }

    async fn replay_cached(
        &self,
        response_topic: &str,
        correlation_data: &bytes::Bytes,
        cached: CachedResponse,
        ack_token: Option<AckToken>,
    ) {
        let properties = PublishProperties {
            correlation_data: Some(correlation_data.clone()),
            response_topic: None,
            content_type: cached.content_type,
            payload_format_indicator: 0,
            message_expiry_interval: None,
            user_properties: cached.user_properties,
        };
        if let Ok(completion_token) =
            self.mqtt_client.publish(response_topic.to_string(), QoS::AtLeastOnce, false, cached.payload, Some(properties)).await
        {
            let _ = completion_token.await;
        }
        if let Some(ack_token) = ack_token {
            let _ = ack_token.ack().await;
        }
    }

    async fn reject(
        &self,
        response_topic: &str,
        correlation_data: &bytes::Bytes,
        status_code: super::StatusCode,
        message: String,
        ack_token: Option<AckToken>,
    ) {
        let headers = vec![
            (UserProperty::Status.to_string(), (status_code as u16).to_string()),
            (UserProperty::StatusMessage.to_string(), message),
        ];
        let properties = PublishProperties {
            correlation_data: Some(correlation_data.clone()),
            response_topic: None,
            content_type: None,
            payload_format_indicator: 0,
            message_expiry_interval: None,
            user_properties: headers,
        };
        if let Ok(completion_token) = self
            .mqtt_client
            .publish(response_topic.to_string(), QoS::AtLeastOnce, false, Vec::new(), Some(properties))
            .await
        {
            let _ = completion_token.await;
        }
        if let Some(ack_token) = ack_token {
            let _ = ack_token.ack().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        application::ApplicationContextBuilder,
        common::payload_serialize::MockPayload,
        mqtt::{control_packet::PublishProperties, mock::MockClient},
        rpc_command::cache::CacheOptionsBuilder,
    };

    #[tokio::test]
    async fn new_subscribes_to_request_topic() {
        let client = MockClient::new("test_executor");
        let options = OptionsBuilder::default()
            .request_topic_pattern("rpc/{commandName}")
            .command_name("doThing")
            .build()
            .unwrap();

        let _executor =
            Executor::<MockPayload, MockPayload, _>::new(ApplicationContextBuilder::default().build().unwrap(), client.clone(), options, None)
                .await
                .unwrap();

        let calls = client.calls();
        assert!(matches!(&calls[0], crate::mqtt::mock::RecordedCall::Subscribe(t) if t == "rpc/doThing"));
    }

    fn mock_payload_expectations() {
        let content_type_ctx = MockPayload::content_type_context();
        content_type_ctx.expect().return_const("application/json");
        let format_indicator_ctx = MockPayload::format_indicator_context();
        format_indicator_ctx.expect().return_const(FormatIndicator::UnspecifiedBytes);
    }

    fn request_publish(correlation_data: bytes::Bytes) -> Publish {
        Publish {
            topic: bytes::Bytes::from_static(b"rpc/doThing"),
            payload: bytes::Bytes::from_static(b"request"),
            qos: QoS::AtLeastOnce,
            retain: false,
            pkid: 1,
            properties: Some(PublishProperties {
                correlation_data: Some(correlation_data),
                response_topic: Some("rpc/doThing/response".to_string()),
                content_type: Some("application/json".to_string()),
                payload_format_indicator: 0,
                message_expiry_interval: Some(30),
                user_properties: vec![(UserProperty::SourceId.to_string(), "invoker_1".to_string())],
            }),
        }
    }

    /// Two requests with identical correlation data from a default (not idempotent, no explicit
    /// `cacheable_duration`) executor must dedup: the second is served from the cache instead of
    /// being yielded as a fresh [`Request`], even though `is_idempotent` is false.
    #[tokio::test]
    async fn second_identical_correlation_request_is_served_from_cache_when_not_idempotent() {
        mock_payload_expectations();
        let deserialize_ctx = MockPayload::deserialize_context();
        deserialize_ctx.expect().returning(|_, _, _| Ok(MockPayload::new()));
        let mut response_payload = MockPayload::new();
        response_payload.expect_serialize().returning(|| Ok(b"response".to_vec()));

        let client = MockClient::new("test_executor");
        let options = OptionsBuilder::default()
            .request_topic_pattern("rpc/{commandName}")
            .command_name("doThing")
            .build()
            .unwrap();
        let cache = ResponseCache::new(CacheOptionsBuilder::default().build().unwrap());
        cache.start();

        let executor = Executor::<MockPayload, MockPayload, _>::new(
            ApplicationContextBuilder::default().build().unwrap(),
            client.clone(),
            options,
            Some(Arc::clone(&cache)),
        )
        .await
        .unwrap();

        let correlation_data = bytes::Bytes::from_static(b"same-correlation");

        let request = executor
            .handle_publish(request_publish(correlation_data.clone()), None)
            .await
            .expect("first delivery of a new correlation id should be a cache miss");
        request
            .complete(ResponseBuilder::default().payload(response_payload).build().unwrap())
            .await
            .unwrap();

        let replay = executor.handle_publish(request_publish(correlation_data), None).await;
        assert!(
            replay.is_none(),
            "identical-correlation retry must be served from the cache, not re-dispatched to the handler"
        );

        let publishes = client
            .calls()
            .into_iter()
            .filter(|call| matches!(call, crate::mqtt::mock::RecordedCall::Publish(..)))
            .count();
        assert_eq!(publishes, 2, "original response plus the replayed cache hit");

        cache.stop();
    }
}
