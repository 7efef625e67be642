// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Utilities for using the Azure IoT Operations Protocol over MQTT: a request/response command
//! pattern and a fire-and-forget telemetry pattern, both layered on MQTT v5 publish topics and
//! ordered with a Hybrid Logical Clock.

#![warn(missing_docs)]
#![allow(clippy::result_large_err)]

pub mod application;
pub mod common;
pub mod mqtt;
pub mod rpc_command;
pub mod telemetry;

#[macro_use]
extern crate derive_builder;

pub use common::protocol_version::ProtocolVersion;
