// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Application-wide utilities for use with the Azure IoT Operations SDK.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::common::{
    aio_protocol_error::AIOProtocolError,
    hybrid_logical_clock::{HybridLogicalClock, DEFAULT_MAX_CLOCK_DRIFT},
};

/// Struct containing the application-level [`HybridLogicalClock`].
pub struct ApplicationHybridLogicalClock {
    /// The [`HybridLogicalClock`] used by the application, wrapped in a Mutex to allow for concurrent access.
    hlc: Mutex<HybridLogicalClock>,
    /// The maximum clock drift allowed for the [`HybridLogicalClock`].
    max_clock_drift: Duration,
}

impl ApplicationHybridLogicalClock {
    /// Creates a new [`ApplicationHybridLogicalClock`] with the provided maximum clock drift.
    #[must_use]
    pub fn new(max_clock_drift: Duration) -> Self {
        Self {
            hlc: Mutex::new(HybridLogicalClock::new()),
            max_clock_drift,
        }
    }

    /// Reads the current value of the [`ApplicationHybridLogicalClock`] without advancing it.
    pub fn read(&self) -> HybridLogicalClock {
        self.hlc.lock().unwrap().clone()
    }

    /// Merges `other_hlc` into the application clock.
    ///
    /// # Errors
    /// See [`HybridLogicalClock::update`].
    pub(crate) fn update(&self, other_hlc: &HybridLogicalClock) -> Result<(), AIOProtocolError> {
        self.hlc
            .lock()
            .unwrap()
            .update(other_hlc, self.max_clock_drift)
    }

    /// Advances the application clock to record a local event and returns its encoded string
    /// representation, ready to attach as an outgoing message's timestamp.
    ///
    /// # Errors
    /// See [`HybridLogicalClock::update`].
    pub(crate) fn update_now(&self) -> Result<String, AIOProtocolError> {
        let mut hlc = self.hlc.lock().unwrap();
        hlc.update_now(self.max_clock_drift)?;
        Ok(hlc.to_string())
    }
}

/// Options for creating an [`ApplicationContext`].
#[derive(Builder)]
#[builder(name = "ApplicationContextBuilder", build_fn(private, name = "build_options"))]
pub struct ApplicationContextOptions {
    /// The maximum clock drift allowed for the [`ApplicationHybridLogicalClock`].
    #[builder(default = "DEFAULT_MAX_CLOCK_DRIFT")]
    pub max_clock_drift: Duration,
}

impl ApplicationContextBuilder {
    /// Builds the [`ApplicationContext`].
    ///
    /// # Errors
    /// Returns [`ApplicationContextBuilderError`] if a field fails validation.
    pub fn build(&self) -> Result<ApplicationContext, ApplicationContextBuilderError> {
        Ok(ApplicationContext::new(self.build_options()?))
    }
}

/// Struct containing the application context for the Azure IoT Operations SDK.
///
/// <div class="warning"> There must be a max of one per session and there should only be one per application (which may contain multiple sessions). </div>
#[derive(Clone)]
pub struct ApplicationContext {
    /// The [`ApplicationHybridLogicalClock`] used by the application.
    pub application_hlc: Arc<ApplicationHybridLogicalClock>,
}

impl ApplicationContext {
    /// Creates a new [`ApplicationContext`] with the provided options.
    #[must_use]
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(options: ApplicationContextOptions) -> Self {
        Self {
            application_hlc: Arc::new(ApplicationHybridLogicalClock::new(options.max_clock_drift)),
        }
    }
}
