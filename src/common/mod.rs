// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Types shared across the command and telemetry envoys: errors, the topic pattern grammar,
//! the hybrid logical clock, CloudEvents metadata, and the payload codec boundary.

pub mod aio_protocol_error;
pub mod cloud_event;
pub mod hybrid_logical_clock;
pub mod payload_serialize;
pub mod protocol_version;
pub mod token_map;
pub mod topic_processor;
pub mod user_properties;
