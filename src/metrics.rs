//! Metric helpers for `modilink`.
//!
//! This module defines metric names and simple helper functions wrapping the
//! [`metrics`](https://docs.rs/metrics) crate. With the `metrics` feature
//! disabled every helper compiles to nothing.

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

/// Name of the counter tracking frames moved through transports.
pub const FRAMES_TOTAL: &str = "modilink_frames_total";
/// Name of the counter tracking frames that failed to decode.
pub const MALFORMED_FRAMES_TOTAL: &str = "modilink_malformed_frames_total";
/// Name of the counter tracking bytes dropped by buffer overflow.
pub const BUFFER_DISCARDED_BYTES_TOTAL: &str = "modilink_buffer_discarded_bytes_total";
/// Name of the counter tracking property requests sent to modules.
pub const PROPERTY_REQUESTS_TOTAL: &str = "modilink_property_requests_total";
/// Name of the gauge tracking connected modules.
pub const MODULES_CONNECTED: &str = "modilink_modules_connected";

/// Direction of frame processing.
#[derive(Clone, Copy, Debug)]
pub enum Direction {
    /// Frames extracted from transport bytes.
    Inbound,
    /// Frames written to a transport.
    Outbound,
}

impl Direction {
    #[cfg_attr(not(feature = "metrics"), allow(dead_code))]
    fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Record a frame for the given direction.
pub fn inc_frames(direction: Direction) {
    #[cfg(feature = "metrics")]
    counter!(FRAMES_TOTAL, "direction" => direction.as_str()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = direction;
}

/// Record a frame dropped as malformed.
pub fn inc_malformed() {
    #[cfg(feature = "metrics")]
    counter!(MALFORMED_FRAMES_TOTAL).increment(1);
}

/// Record bytes dropped by the frame buffer.
pub fn inc_discarded_bytes(bytes: usize) {
    #[cfg(feature = "metrics")]
    counter!(BUFFER_DISCARDED_BYTES_TOTAL).increment(bytes as u64);
    #[cfg(not(feature = "metrics"))]
    let _ = bytes;
}

/// Record a property request sent to a module.
pub fn inc_property_requests() {
    #[cfg(feature = "metrics")]
    counter!(PROPERTY_REQUESTS_TOTAL).increment(1);
}

/// Publish the number of connected modules.
#[allow(clippy::cast_precision_loss, reason = "module counts stay far below 2^52")]
pub fn set_modules_connected(count: usize) {
    #[cfg(feature = "metrics")]
    gauge!(MODULES_CONNECTED).set(count as f64);
    #[cfg(not(feature = "metrics"))]
    let _ = count;
}
