// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The MQTT v5 adapter boundary consumed by the rest of this crate.

pub mod control_packet;
pub mod interface;

#[cfg(test)]
pub mod mock;
