//! Metric names and recording helpers.
//!
//! Recorded through the `metrics` facade; nothing is exported unless the
//! application installs a recorder.

use mortar_core::MessageKind;

use crate::mux::Side;

/// Connections that reached `Connected`, labelled by side.
pub const CONNECTIONS_OPENED: &str = "mortar_connections_opened_total";
/// Connections that left `Connected`, labelled by side.
pub const CONNECTIONS_CLOSED: &str = "mortar_connections_closed_total";
/// Connections currently `Connected`, labelled by side.
pub const CONNECTIONS_ACTIVE: &str = "mortar_connections_active";
/// TLS or protocol handshakes that failed, labelled by side.
pub const HANDSHAKE_FAILURES: &str = "mortar_handshake_failures_total";
/// Frames written, labelled by message kind.
pub const FRAMES_SENT: &str = "mortar_frames_sent_total";
/// Frames read, labelled by message kind.
pub const FRAMES_RECEIVED: &str = "mortar_frames_received_total";
/// Connections torn down for a protocol violation.
pub const PROTOCOL_ERRORS: &str = "mortar_protocol_errors_total";

pub(crate) fn connection_opened(side: Side) {
    metrics::counter!(CONNECTIONS_OPENED, "side" => side.as_str()).increment(1);
    metrics::gauge!(CONNECTIONS_ACTIVE, "side" => side.as_str()).increment(1.0);
}

pub(crate) fn connection_closed(side: Side) {
    metrics::counter!(CONNECTIONS_CLOSED, "side" => side.as_str()).increment(1);
    metrics::gauge!(CONNECTIONS_ACTIVE, "side" => side.as_str()).decrement(1.0);
}

pub(crate) fn handshake_failed(side: Side) {
    metrics::counter!(HANDSHAKE_FAILURES, "side" => side.as_str()).increment(1);
}

pub(crate) fn frame_sent(kind: MessageKind) {
    metrics::counter!(FRAMES_SENT, "kind" => kind.as_str()).increment(1);
}

pub(crate) fn frame_received(kind: MessageKind) {
    metrics::counter!(FRAMES_RECEIVED, "kind" => kind.as_str()).increment(1);
}

pub(crate) fn protocol_error() {
    metrics::counter!(PROTOCOL_ERRORS).increment(1);
}
