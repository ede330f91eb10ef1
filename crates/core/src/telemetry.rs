//! Forwarding lifecycle events, logged under `ferry::telemetry` and counted with `metrics`.

use crate::classify::Severity;
use crate::errors::ProxyError;
use std::fmt;
use std::time::Duration;

const TARGET: &str = "ferry::telemetry";

/// Identifies the route a request was forwarded on, used to label telemetry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteInfo {
    cluster_id: String,
    route_id: String,
    destination_id: String,
}

impl RouteInfo {
    /// Create route labels.
    pub fn new(
        cluster_id: impl Into<String>,
        route_id: impl Into<String>,
        destination_id: impl Into<String>,
    ) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            route_id: route_id.into(),
            destination_id: destination_id.into(),
        }
    }

    /// Cluster the destination belongs to.
    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// Route that matched the request.
    pub fn route_id(&self) -> &str {
        &self.route_id
    }

    /// Destination the request was sent to.
    pub fn destination_id(&self) -> &str {
        &self.destination_id
    }
}

/// Milestones of a single forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwarderStage {
    /// The forward began.
    Start,
    /// The outgoing request was handed to the invoker.
    SendAsyncStart,
    /// The destination response head arrived.
    SendAsyncStop,
    /// The response body copy started.
    ResponseContentTransferStart,
    /// Both sides of a protocol upgrade are being relayed.
    ResponseUpgrade,
}

impl ForwarderStage {
    /// Stable identifier used in events.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::SendAsyncStart => "send_async_start",
            Self::SendAsyncStop => "send_async_stop",
            Self::ResponseContentTransferStart => "response_content_transfer_start",
            Self::ResponseUpgrade => "response_upgrade",
        }
    }
}

impl fmt::Display for ForwarderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a content copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    /// Client to destination.
    Request,
    /// Destination to client.
    Response,
}

impl CopyDirection {
    /// Stable identifier used in labels.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
        }
    }
}

/// Totals reported when a content copy ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferStats {
    /// Bytes written to the destination stream.
    pub bytes: u64,
    /// Read operations performed.
    pub reads: u64,
    /// Write operations performed.
    pub writes: u64,
    /// Wall time of the copy.
    pub elapsed: Duration,
}

pub(crate) fn forwarder_start(route: &RouteInfo, destination_prefix: &str) {
    tracing::debug!(
        target: TARGET,
        stage = %ForwarderStage::Start,
        cluster = route.cluster_id(),
        route = route.route_id(),
        destination_prefix,
        "forwarder started"
    );
}

pub(crate) fn forwarder_stage(route: &RouteInfo, stage: ForwarderStage) {
    tracing::trace!(
        target: TARGET,
        %stage,
        cluster = route.cluster_id(),
        route = route.route_id(),
        "forwarder stage"
    );
}

pub(crate) fn forwarder_stop(
    route: &RouteInfo,
    status: http::StatusCode,
    error: Option<ProxyError>,
) {
    tracing::debug!(
        target: TARGET,
        status = status.as_u16(),
        error = error.map(ProxyError::as_str),
        cluster = route.cluster_id(),
        route = route.route_id(),
        "forwarder stopped"
    );
    let outcome = if error.is_some() { "failure" } else { "success" };
    metrics::counter!("ferry_forwarder_requests_total", "outcome" => outcome).increment(1);
}

pub(crate) fn forwarder_failed(route: &RouteInfo, error: ProxyError, severity: Severity) {
    tracing::debug!(
        target: TARGET,
        %error,
        severity = severity.as_str(),
        cluster = route.cluster_id(),
        route = route.route_id(),
        "forwarder failed"
    );
    metrics::counter!(
        "ferry_forwarder_errors_total",
        "error" => error.as_str(),
        "severity" => severity.as_str()
    )
    .increment(1);
}

pub(crate) fn content_transferred(
    route: &RouteInfo,
    direction: CopyDirection,
    stats: TransferStats,
    completed: bool,
) {
    tracing::trace!(
        target: TARGET,
        direction = direction.as_str(),
        bytes = stats.bytes,
        reads = stats.reads,
        writes = stats.writes,
        elapsed_ms = u64::try_from(stats.elapsed.as_millis()).unwrap_or(u64::MAX),
        completed,
        cluster = route.cluster_id(),
        "content transferred"
    );
    let labels = [
        ("direction", direction.as_str().to_owned()),
        ("cluster", route.cluster_id().to_owned()),
        ("route", route.route_id().to_owned()),
        ("destination", route.destination_id().to_owned()),
    ];
    metrics::counter!("ferry_content_bytes_total", &labels).increment(stats.bytes);
    metrics::counter!("ferry_content_reads_total", &labels).increment(stats.reads);
    metrics::counter!("ferry_content_writes_total", &labels).increment(stats.writes);
}

#[cfg(test)]
pub(crate) mod tests {
    use metrics::{
        Counter, CounterFn, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString,
        Unit,
    };
    use std::sync::{Arc, Mutex};

    type Increments = Arc<Mutex<Vec<(Key, u64)>>>;

    /// Recorder that keeps every counter increment so tests can assert on emitted metrics.
    ///
    /// Install it with [`metrics::set_default_local_recorder`] on a current-thread runtime.
    #[derive(Debug, Default)]
    pub(crate) struct CountingRecorder {
        increments: Increments,
    }

    impl CountingRecorder {
        /// Sum of the increments of counter `name` carrying every label in `labels`.
        pub(crate) fn total(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
            let Ok(increments) = self.increments.lock() else {
                return 0;
            };
            increments
                .iter()
                .filter(|(key, _)| key.name() == name)
                .filter(|(key, _)| {
                    labels.iter().all(|(label, value)| {
                        key.labels()
                            .any(|found| found.key() == *label && found.value() == *value)
                    })
                })
                .map(|(_, value)| value)
                .sum()
        }
    }

    struct RecordedCounter {
        key: Key,
        increments: Increments,
    }

    impl CounterFn for RecordedCounter {
        fn increment(&self, value: u64) {
            if let Ok(mut increments) = self.increments.lock() {
                increments.push((self.key.clone(), value));
            }
        }

        fn absolute(&self, _value: u64) {}
    }

    impl Recorder for CountingRecorder {
        fn describe_counter(
            &self,
            _key: KeyName,
            _unit: Option<Unit>,
            _description: SharedString,
        ) {
        }

        fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

        fn describe_histogram(
            &self,
            _key: KeyName,
            _unit: Option<Unit>,
            _description: SharedString,
        ) {
        }

        fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
            Counter::from_arc(Arc::new(RecordedCounter {
                key: key.clone(),
                increments: self.increments.clone(),
            }))
        }

        fn register_gauge(&self, _key: &Key, _metadata: &Metadata<'_>) -> Gauge {
            Gauge::noop()
        }

        fn register_histogram(&self, _key: &Key, _metadata: &Metadata<'_>) -> Histogram {
            Histogram::noop()
        }
    }
}
