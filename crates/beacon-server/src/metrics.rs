// Metric descriptions for the counters the discovery and messaging crates
// record, plus the node runtime's own peer metrics.

use std::time::Instant;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Register metric descriptions. Call once at startup, after the recorder
/// (if any) is installed.
pub fn init_metrics() {
    // Registration
    describe_counter!(
        "registry_registrations_total",
        "Total number of successful node registrations"
    );
    describe_counter!(
        "registry_lease_renewals_total",
        "Total number of lease keep-alives"
    );
    describe_counter!(
        "registry_lease_losses_total",
        "Total number of failed keep-alives that forced a re-registration"
    );

    // Watching
    describe_counter!(
        "watcher_events_total",
        "Total number of UP/DOWN events delivered to listeners"
    );
    describe_counter!(
        "watcher_resubscribes_total",
        "Total number of watch resubscriptions after a failure"
    );

    // Messaging, client side
    describe_counter!("protocol_requests_total", "Total number of requests sent");
    describe_counter!(
        "protocol_request_failures_total",
        "Total number of requests that ended without an accepted response"
    );
    describe_counter!(
        "protocol_responses_discarded_total",
        "Total number of responses with no pending request"
    );
    describe_counter!(
        "protocol_notifications_sent_total",
        "Total number of notifications published"
    );

    // Messaging, server side
    describe_counter!(
        "protocol_requests_received_total",
        "Total number of requests dispatched to handlers"
    );
    describe_counter!(
        "protocol_notifications_received_total",
        "Total number of notifications dispatched to handlers"
    );
    describe_counter!(
        "protocol_rejections_sent_total",
        "Total number of rejections replied"
    );

    // Node runtime
    describe_gauge!("node_peers_up", "Number of peers currently UP");
    describe_counter!("node_peer_pings_total", "Total number of pings sent to peers");
    describe_histogram!(
        "node_peer_ping_duration_seconds",
        "Round trip of a peer ping in seconds"
    );

    tracing::info!("Metrics initialized");
}

/// Update the number of known UP peers
pub fn set_peers_up(count: usize) {
    gauge!("node_peers_up").set(count as f64);
}

/// Record the outcome of one peer ping
pub fn record_peer_ping(accepted: bool, duration_secs: f64) {
    let outcome = if accepted { "accepted" } else { "rejected" };
    counter!("node_peer_pings_total", "outcome" => outcome).increment(1);
    if accepted {
        histogram!("node_peer_ping_duration_seconds").record(duration_secs);
    }
}

/// Timer helper for measuring operation duration
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer() {
        let timer = Timer::new();
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(timer.elapsed_secs() >= 0.01);
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        init_metrics();
        set_peers_up(3);
        record_peer_ping(true, 0.002);
        record_peer_ping(false, 0.0);
    }
}
