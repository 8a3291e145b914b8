use std::fmt;

use opentelemetry::{
    global,
    metrics::Counter,
    KeyValue,
};

/// Lifecycle counters, labelled by plugin name.
///
/// Instruments come from the global meter provider; without an installed
/// exporter they are no-ops.
#[derive(Clone)]
pub struct Telemetry {
    spinups: Counter<u64>,
    failures: Counter<u64>,
    invocations: Counter<u64>,
}

impl Telemetry {
    pub fn new() -> Self {
        let meter = global::meter("orchestrator");
        let spinups = meter
            .u64_counter("plugin_spinups")
            .with_description("Plugins that completed their handshake")
            .build();
        let failures = meter
            .u64_counter("plugin_failures")
            .with_description("Plugin launches that failed or ended")
            .build();
        let invocations = meter
            .u64_counter("plugin_invocations")
            .with_description("Successful run calls")
            .build();
        Self { spinups, failures, invocations }
    }

    pub fn spinup(&self, plugin: &str) {
        self.spinups.add(1, &[label(plugin)]);
    }

    pub fn failure(&self, plugin: &str) {
        self.failures.add(1, &[label(plugin)]);
    }

    pub fn invocation(&self, plugin: &str) {
        self.invocations.add(1, &[label(plugin)]);
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Telemetry")
    }
}

fn label(plugin: &str) -> KeyValue {
    KeyValue::new("plugin", plugin.to_string())
}
