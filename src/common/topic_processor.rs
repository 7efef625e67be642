// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use regex::Regex;

use super::aio_protocol_error::{AIOProtocolError, Value};
use std::collections::HashMap;

/// Wildcard token
pub const WILDCARD: &str = "+";

/// Check if a string contains invalid characters specified in [topic-structure.md](https://github.com/microsoft/mqtt-patterns/blob/main/docs/specs/topic-structure.md)
///
/// Returns true if the string contains any of the following:
/// - Non-ASCII characters
/// - Characters outside the range of '!' to '~'
/// - Characters '+', '#', '{', '}'
///
/// # Arguments
/// * `s` - A string slice to check for invalid characters
#[must_use]
pub fn contains_invalid_char(s: &str) -> bool {
    s.chars().any(|c| {
        !c.is_ascii() || !('!'..='~').contains(&c) || c == '+' || c == '#' || c == '{' || c == '}'
    })
}

/// Determine whether a string is valid for use as a replacement string in a custom replacement map
/// or a topic namespace based on [topic-structure.md](https://github.com/microsoft/mqtt-patterns/blob/main/docs/specs/topic-structure.md)
///
/// Returns true if the string is not empty, does not contain invalid characters, does not start or
/// end with '/', and does not contain "//"
///
/// # Arguments
/// * `s` - A string slice to check for validity
#[must_use]
pub fn is_valid_replacement(s: &str) -> bool {
    !(s.is_empty()
        || contains_invalid_char(s)
        || s.starts_with('/')
        || s.ends_with('/')
        || s.contains("//"))
}

/// Represents a topic pattern for Azure IoT Operations Protocol topics
#[derive(Debug)]
pub struct TopicPattern {
    topic_pattern: String,
    pattern_regex: Regex,
}

impl TopicPattern {
    /// Validates and compiles a topic pattern.
    ///
    /// `token_map` is the resident token map: entries here are substituted permanently into the
    /// pattern at construction time. Tokens with no resident replacement remain in the compiled
    /// pattern as `{token}` placeholders, to be resolved per-call (transiently) via
    /// [`TopicPattern::as_publish_topic`], or left as the MQTT wildcard `+` via
    /// [`TopicPattern::as_subscribe_topic`].
    ///
    /// # Errors
    /// Returns [`AIOProtocolError`] of kind
    /// [`ConfigurationInvalid`](crate::common::aio_protocol_error::AIOProtocolErrorKind::ConfigurationInvalid)
    /// if the pattern or any resident replacement is invalid.
    pub fn new<'a>(
        pattern: &'a str,
        topic_namespace: Option<&str>,
        token_map: &'a HashMap<String, String>,
    ) -> Result<Self, AIOProtocolError> {
        if pattern.trim().is_empty() {
            return Err(AIOProtocolError::new_configuration_invalid_error(
                None,
                "pattern",
                Value::String(pattern.to_string()),
                Some("MQTT topic pattern must not be empty".to_string()),
                None,
            ));
        }

        if pattern.starts_with('$') {
            return Err(AIOProtocolError::new_configuration_invalid_error(
                None,
                "pattern",
                Value::String(pattern.to_string()),
                Some("MQTT topic pattern starts with reserved character '$'".to_string()),
                None,
            ));
        }

        // Check for invalid characters, also needed to safely use pattern.as_bytes() later
        if !pattern.is_ascii() {
            return Err(AIOProtocolError::new_configuration_invalid_error(
                None,
                "pattern",
                Value::String(pattern.to_string()),
                Some("MQTT topic pattern contains non-ASCII characters".to_string()),
                None,
            ));
        }

        // Needed to check for tokens being next to each other, i.e {token}{token}, without using
        // chars() which is O(n).
        let pattern_as_bytes = pattern.as_bytes();

        // Matches empty levels at the start, middle, or end of the string
        let empty_level_regex =
            Regex::new(r"((^\s*/)|(/\s*/)|(/\s*$))").expect("Static regex string should not fail");

        if empty_level_regex.is_match(pattern) {
            return Err(AIOProtocolError::new_configuration_invalid_error(
                None,
                "pattern",
                Value::String(pattern.to_string()),
                Some("MQTT topic pattern contains empty levels".to_string()),
                None,
            ));
        }

        let mut working_pattern = String::new();

        if let Some(topic_namespace) = topic_namespace {
            if !is_valid_replacement(topic_namespace) {
                return Err(AIOProtocolError::new_configuration_invalid_error(
                    None,
                    "topic_namespace",
                    Value::String(topic_namespace.to_string()),
                    Some("MQTT topic pattern contains invalid topic namespace".to_string()),
                    None,
                ));
            }
            working_pattern.push_str(topic_namespace);
            working_pattern.push('/');
        }

        // Matches any tokens in the pattern
        let pattern_regex =
            Regex::new(r"(?P<token>\{[^}]+\})").expect("Static regex string should not fail");
        let invalid_regex =
            Regex::new(r"([^\x21-\x7E]|[+#{}])").expect("Static regex string should not fail");

        let mut last_match = 0;
        for caps in pattern_regex.captures_iter(pattern) {
            let token_capture = caps
                .name("token")
                .expect("Checked the other two groups, token should always be present"); // FIN: better docs
            let token = token_capture.as_str();

            if token.trim().is_empty() {
                return Err(AIOProtocolError::new_configuration_invalid_error(
                    None,
                    "pattern",
                    Value::String(pattern.to_string()),
                    Some("MQTT topic pattern contains empty token".to_string()),
                    None,
                ));
            }

            if let Some(c) = pattern_as_bytes.get(token_capture.end()) {
                if *c == b'{' {
                    return Err(AIOProtocolError::new_configuration_invalid_error(
                        None,
                        "pattern",
                        Value::String(pattern.to_string()),
                        Some("MQTT topic pattern contains adjacent tokens".to_string()),
                        None,
                    ));
                }
            }

            let acc_pattern = &pattern[last_match..token_capture.start()]; // FIN: Check if this is correct

            if invalid_regex.is_match(acc_pattern) {
                return Err(AIOProtocolError::new_configuration_invalid_error(
                    None,
                    "pattern",
                    Value::String(pattern.to_string()),
                    Some("MQTT topic pattern contains invalid characters".to_string()),
                    None,
                ));
            }

            working_pattern.push_str(acc_pattern);
            let stripped_token = &token[1..token.len() - 1];

            if invalid_regex.is_match(stripped_token) || stripped_token.contains('/') {
                return Err(AIOProtocolError::new_configuration_invalid_error(
                    None,
                    "pattern",
                    Value::String(stripped_token.to_string()),
                    Some(format!(
                        "MQTT topic pattern contains invalid characters in token '{token}'",
                    )),
                    None,
                ));
            }

            if let Some(val) = token_map.get(stripped_token) {
                if !is_valid_replacement(val) {
                    return Err(AIOProtocolError::new_configuration_invalid_error(
                        None,
                        stripped_token,
                        Value::String(val.to_string()),
                        Some(format!(
                            "MQTT topic pattern contains token '{token}', but replacement value '{val}' is not valid",
                        )),
                        None,
                    ));
                }
                working_pattern.push_str(val);
            } else {
                working_pattern.push_str(token);
            }
            last_match = token_capture.end();
        }

        let acc_pattern = &pattern[last_match..];

        // Check the last part of the pattern
        if invalid_regex.is_match(acc_pattern) {
            return Err(AIOProtocolError::new_configuration_invalid_error(
                None,
                "pattern",
                Value::String(pattern.to_string()),
                Some("MQTT topic pattern contains invalid characters".to_string()),
                None,
            ));
        }

        working_pattern.push_str(acc_pattern);

        Ok(TopicPattern {
            topic_pattern: working_pattern,
            pattern_regex,
        })
    }

    /// Resolves this pattern to an MQTT subscription filter: every remaining `{token}`
    /// placeholder (one with no resident replacement) becomes the single-level wildcard `+`.
    #[must_use]
    pub fn as_subscribe_topic(&self) -> String {
        self.pattern_regex
            .replace_all(&self.topic_pattern, WILDCARD.to_string())
            .to_string()
    }

    /// Resolves this pattern to a concrete publish topic using `tokens` as the transient
    /// replacement map for any token not already resolved by the resident map at construction.
    ///
    /// # Errors
    /// Returns [`AIOProtocolError`] of kind
    /// [`ConfigurationInvalid`](crate::common::aio_protocol_error::AIOProtocolErrorKind::ConfigurationInvalid)
    /// if a remaining token has no entry in `tokens`, or its replacement value is invalid.
    pub fn as_publish_topic(
        &self,
        tokens: &HashMap<String, String>,
    ) -> Result<String, AIOProtocolError> {
        let mut publish_topic = String::with_capacity(self.topic_pattern.len());
        let mut last_match = 0;

        for caps in self.pattern_regex.captures_iter(&self.topic_pattern) {
            let key_cap = caps.name("token").expect("Token should always be present");
            let key = &key_cap.as_str()[1..key_cap.as_str().len() - 1];
            publish_topic.push_str(&self.topic_pattern[last_match..key_cap.start()]);
            if let Some(val) = tokens.get(key) {
                if !is_valid_replacement(val) {
                    return Err(AIOProtocolError::new_configuration_invalid_error(
                        None,
                        key,
                        Value::String(val.to_string()),
                        Some(format!(
                            "MQTT topic pattern contains token '{key}', but replacement value '{val}' is not valid",
                        )),
                        None,
                    ));
                }
                publish_topic.push_str(val);
            } else {
                return Err(AIOProtocolError::new_configuration_invalid_error(
                    None,
                    key,
                    Value::String(String::new()),
                    Some(format!(
                        "MQTT topic pattern contains token '{key}', but no replacement value provided"
                    )),
                    None,
                ));
            }
            last_match = key_cap.end();
        }

        publish_topic.push_str(&self.topic_pattern[last_match..]);

        Ok(publish_topic)
    }

    /// Extracts token values from a concrete, matching MQTT topic name by walking this
    /// pattern's remaining `{token}` placeholders in order.
    #[must_use]
    pub fn parse_tokens(&self, topic: &str) -> HashMap<String, String> {
        let mut tokens = HashMap::new();

        let mut topic_ref = topic;
        let mut last_token_end = 0;

        for find in self.pattern_regex.find_iter(&self.topic_pattern) {
            let token_start = find.start();
            let token_end = find.end();

            let value_start = token_start - last_token_end;
            last_token_end = token_end + 1;

            topic_ref = &topic_ref[value_start..];
            let (value, rest) = topic_ref.split_once('/').unwrap_or((topic_ref, ""));
            topic_ref = rest;

            tokens.insert(
                find.as_str()[1..find.as_str().len() - 1].to_string(),
                value.to_string(),
            );
        }

        tokens
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::common::aio_protocol_error::AIOProtocolErrorKind;

    #[test_case("devices", "devices"; "single level")]
    #[test_case("devices/status", "devices/status"; "two levels")]
    #[test_case("{executorId}", "{executorId}"; "bare placeholder")]
    #[test_case("{deviceId}", "thermostat-7"; "resident token resolved at construction")]
    #[test_case("devices/{deviceId}", "devices/thermostat-7"; "resident token trailing")]
    #[test_case("{deviceId}/status", "thermostat-7/status"; "resident token leading")]
    #[test_case("devices/{deviceId}/status", "devices/thermostat-7/status"; "resident token interior")]
    #[test_case("devices/{deviceId}/readings/{deviceId}", "devices/thermostat-7/readings/thermostat-7"; "resident token repeated")]
    #[test_case("{executorId}/{deviceId}", "{executorId}/thermostat-7"; "placeholder beside resident token")]
    #[test_case("devices/{deviceId}/{executorId}", "devices/thermostat-7/{executorId}"; "placeholder trailing alongside resident token")]
    #[test_case("{executorId}/devices/{deviceId}", "{executorId}/devices/thermostat-7"; "placeholder leading alongside resident token")]
    #[test_case("devices/{deviceId}/{executorId}/status", "devices/thermostat-7/{executorId}/status"; "placeholder interior alongside resident token")]
    fn resolves_resident_tokens_at_construction(pattern: &str, result: &str) {
        let token_map = HashMap::from([("deviceId".to_string(), "thermostat-7".to_string())]);

        let pattern = TopicPattern::new(pattern, None, &token_map).unwrap();

        assert_eq!(pattern.topic_pattern, result);
    }

    #[test_case(""; "empty")]
    #[test_case(" "; "whitespace only")]
    #[test_case("$devices/{deviceId}"; "starts with dollar")]
    #[test_case("/devices/{deviceId}"; "starts with slash")]
    #[test_case("{deviceId}/devices/"; "ends with slash")]
    #[test_case("devices//{deviceId}"; "contains double slash")]
    #[test_case(" /devices/{deviceId}"; "starts with whitespace")]
    #[test_case("{deviceId}/devices/ "; "ends with whitespace")]
    #[test_case("devices/ /devices/{deviceId}"; "level is only whitespace")]
    #[test_case("devices/dev ices/devices/{deviceId}"; "level contains whitespace")]
    #[test_case("devices/dev+ices/devices/{deviceId}"; "level contains plus")]
    #[test_case("devices/dev#ices/devices/{deviceId}"; "level contains hash")]
    #[test_case("devices/dev}ices/devices/{deviceId}"; "level contains close brace")]
    #[test_case("devices/dev\u{0000}ices/devices/{deviceId}"; "level contains non-ASCII")]
    #[test_case("{deviceId}{deviceId}"; "back-to-back tokens")]
    #[test_case("{deviceId}{}"; "token followed by empty placeholder")]
    #[test_case("{}{}"; "two empty placeholders")]
    #[test_case("devices/{deviceId}}"; "stray closing brace")]
    fn rejects_malformed_pattern(pattern: &str) {
        let token_map = HashMap::from([("deviceId".to_string(), "thermostat-7".to_string())]);

        let err = TopicPattern::new(pattern, None, &token_map).unwrap_err();
        assert_eq!(err.kind, AIOProtocolErrorKind::ConfigurationInvalid);
        assert_eq!(err.property_name, Some("pattern".to_string()));
        assert_eq!(err.property_value, Some(Value::String(pattern.to_string())));
    }

    #[test_case("fleetA"; "single level")]
    #[test_case("fleetA/buildingB"; "multiple levels")]
    fn accepts_well_formed_namespace(topic_namespace: &str) {
        let pattern = "devices/{deviceId}";
        let token_map = HashMap::from([("deviceId".to_string(), "thermostat-7".to_string())]);

        TopicPattern::new(pattern, Some(topic_namespace), &token_map).unwrap();
    }

    #[test_case(""; "empty")]
    #[test_case(" "; "whitespace")]
    #[test_case("fleet A"; "contains space")]
    #[test_case("fleet+A"; "contains plus")]
    #[test_case("fleet#A"; "contains hash")]
    #[test_case("fleet{A"; "contains open brace")]
    #[test_case("fleet}A"; "contains close brace")]
    #[test_case("fleet\u{0000}A"; "contains non-ASCII")]
    fn rejects_malformed_namespace(topic_namespace: &str) {
        let pattern = "devices/{deviceId}";
        let token_map = HashMap::from([("deviceId".to_string(), "thermostat-7".to_string())]);

        let err = TopicPattern::new(pattern, Some(topic_namespace), &token_map).unwrap_err();
        assert_eq!(err.kind, AIOProtocolErrorKind::ConfigurationInvalid);
        assert_eq!(err.property_name, Some("topic_namespace".to_string()));
        assert_eq!(
            err.property_value,
            Some(Value::String(topic_namespace.to_string()))
        );
    }

    #[test_case("devices/{{deviceId}", "{deviceId"; "open brace inside name")]
    #[test_case("devices/{device+Id}", "device+Id"; "plus inside name")]
    #[test_case("devices/{device#Id}", "device#Id"; "hash inside name")]
    #[test_case("devices/{device/Id}", "device/Id"; "slash inside name")]
    #[test_case("devices/{device\u{0000}Id}", "device\u{0000}Id"; "non-ASCII inside name")]
    fn rejects_malformed_token_name(pattern: &str, property_value: &str) {
        let token_map = HashMap::new();
        let err = TopicPattern::new(pattern, None, &token_map).unwrap_err();
        assert_eq!(err.kind, AIOProtocolErrorKind::ConfigurationInvalid);
        assert_eq!(err.property_name, Some("pattern".to_string()));
        assert_eq!(
            err.property_value,
            Some(Value::String(property_value.to_string()))
        );
    }

    #[test_case("bad value"; "contains space")]
    #[test_case("bad+value"; "contains plus")]
    #[test_case("bad#value"; "contains hash")]
    #[test_case("bad{value"; "contains open brace")]
    #[test_case("bad}value"; "contains close brace")]
    #[test_case("bad//value"; "contains double slash")]
    #[test_case("bad\u{0000}value"; "contains non-ASCII")]
    #[test_case("/badvalue"; "starts with slash")]
    #[test_case("badvalue/"; "ends with slash")]
    #[test_case(""; "is empty")]
    #[test_case(" "; "is only space")]
    fn rejects_malformed_resident_replacement(replacement: &str) {
        let pattern = "devices/{deviceId}/status";
        let token_map = HashMap::from([("deviceId".to_string(), replacement.to_string())]);

        let err = TopicPattern::new(pattern, None, &token_map).unwrap_err();
        assert_eq!(err.kind, AIOProtocolErrorKind::ConfigurationInvalid);
        assert_eq!(err.property_name, Some("deviceId".to_string()));
        assert_eq!(
            err.property_value,
            Some(Value::String(replacement.to_string()))
        );
    }

    #[test_case("devices", "devices"; "no placeholder")]
    #[test_case("{executorId}", "+"; "single placeholder")]
    #[test_case("{executorId}/status", "+/status"; "placeholder leading")]
    #[test_case("devices/{executorId}", "devices/+"; "placeholder trailing")]
    #[test_case("devices/{executorId}/status", "devices/+/status"; "placeholder interior")]
    #[test_case("{executorId}/{executorId}", "+/+"; "repeated placeholder")]
    #[test_case("{executorId}/status/{executorId}", "+/status/+"; "placeholder leading and trailing")]
    #[test_case("{deviceId}/{executorId}", "+/+"; "two distinct placeholders")]
    fn builds_subscribe_filter_with_single_level_wildcards(pattern: &str, result: &str) {
        let token_map = HashMap::new();
        let pattern = TopicPattern::new(pattern, None, &token_map).unwrap();

        assert_eq!(pattern.as_subscribe_topic(), result);
    }

    #[test_case("devices", &HashMap::new(), "devices"; "no placeholder")]
    #[test_case("{deviceId}", &HashMap::from([("deviceId".to_string(), "thermostat-7".to_string())]), "thermostat-7"; "single placeholder")]
    #[test_case("{deviceId}/status", &HashMap::from([("deviceId".to_string(), "thermostat-7".to_string())]), "thermostat-7/status"; "placeholder leading")]
    #[test_case("devices/{deviceId}", &HashMap::from([("deviceId".to_string(), "thermostat-7".to_string())]), "devices/thermostat-7"; "placeholder trailing")]
    #[test_case("devices/{deviceId}/status", &HashMap::from([("deviceId".to_string(), "thermostat-7".to_string())]), "devices/thermostat-7/status"; "placeholder interior")]
    #[test_case("{deviceId}/{executorId}", &HashMap::from([("deviceId".to_string(), "thermostat-7".to_string()), ("executorId".to_string(), "gateway-3".to_string())]), "thermostat-7/gateway-3"; "two distinct placeholders")]
    fn resolves_transient_tokens_for_publish(
        pattern: &str,
        tokens: &HashMap<String, String>,
        result: &str,
    ) {
        let pattern = TopicPattern::new(pattern, None, tokens).unwrap();

        assert_eq!(pattern.as_publish_topic(tokens).unwrap(), result);
    }

    #[test_case("{deviceId}", &HashMap::new(), "deviceId", ""; "no replacement supplied")]
    #[test_case("{deviceId}", &HashMap::from([("deviceId".to_string(), "bad value".to_string())]), "deviceId", "bad value"; "replacement contains space")]
    #[test_case("{deviceId}", &HashMap::from([("deviceId".to_string(), "bad+value".to_string())]), "deviceId", "bad+value"; "replacement contains plus")]
    #[test_case("{deviceId}", &HashMap::from([("deviceId".to_string(), "bad#value".to_string())]), "deviceId", "bad#value"; "replacement contains hash")]
    #[test_case("{deviceId}", &HashMap::from([("deviceId".to_string(), "bad{value".to_string())]), "deviceId", "bad{value"; "replacement contains open brace")]
    #[test_case("{deviceId}", &HashMap::from([("deviceId".to_string(), "bad}value".to_string())]), "deviceId", "bad}value"; "replacement contains close brace")]
    #[test_case("{deviceId}", &HashMap::from([("deviceId".to_string(), "bad//value".to_string())]), "deviceId", "bad//value"; "replacement contains double slash")]
    #[test_case("{deviceId}", &HashMap::from([("deviceId".to_string(), "bad\u{0000}value".to_string())]), "deviceId", "bad\u{0000}value"; "replacement contains non-ASCII")]
    #[test_case("{deviceId}", &HashMap::from([("deviceId".to_string(), "/badvalue".to_string())]), "deviceId", "/badvalue"; "replacement starts with slash")]
    #[test_case("{deviceId}", &HashMap::from([("deviceId".to_string(), "badvalue/".to_string())]), "deviceId", "badvalue/"; "replacement ends with slash")]
    #[test_case("{deviceId}", &HashMap::from([("deviceId".to_string(), String::new())]), "deviceId", ""; "replacement is empty")]
    #[test_case("{deviceId}", &HashMap::from([("deviceId".to_string(), " ".to_string())]), "deviceId", " "; "replacement is only space")]
    fn rejects_malformed_transient_replacement(
        pattern: &str,
        tokens: &HashMap<String, String>,
        property_name: &str,
        property_value: &str,
    ) {
        let pattern = TopicPattern::new(pattern, None, &HashMap::new()).unwrap();

        let err = pattern.as_publish_topic(tokens).unwrap_err();
        assert_eq!(err.kind, AIOProtocolErrorKind::ConfigurationInvalid);
        assert_eq!(err.property_name, Some(property_name.to_string()));
        assert_eq!(
            err.property_value,
            Some(Value::String(property_value.to_string()))
        );
    }

    #[test_case("devices", "devices", &HashMap::new(); "no placeholder")]
    #[test_case("{deviceId}", "thermostat-7", &HashMap::from([("deviceId".to_string(), "thermostat-7".to_string())]); "single placeholder")]
    #[test_case("{deviceId}/status", "thermostat-7/status", &HashMap::from([("deviceId".to_string(), "thermostat-7".to_string())]); "placeholder leading")]
    #[test_case("devices/{deviceId}", "devices/thermostat-7", &HashMap::from([("deviceId".to_string(), "thermostat-7".to_string())]); "placeholder trailing")]
    #[test_case("devices/{deviceId}/status", "devices/thermostat-7/status", &HashMap::from([("deviceId".to_string(), "thermostat-7".to_string())]); "placeholder interior")]
    #[test_case("{deviceId}/{executorId}", "thermostat-7/gateway-3", &HashMap::from([("deviceId".to_string(), "thermostat-7".to_string()),("executorId".to_string(), "gateway-3".to_string())]); "two distinct placeholders")]
    fn extracts_tokens_from_matching_topic(
        pattern: &str,
        topic: &str,
        result: &HashMap<String, String>,
    ) {
        let pattern = TopicPattern::new(pattern, None, &HashMap::new()).unwrap();

        assert_eq!(pattern.parse_tokens(topic), *result);
    }
}
