//! Inbound message routing: decode, identify the device, update presence,
//! then dispatch on the topic's kind.

use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::error::{MonitorError, MonitorResult};
use crate::monitor::Monitor;
use crate::mqtt::{classify, extract_device_id, TelemetryKind};

/// How a single message ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Handled(TelemetryKind),
    /// Handler ran and failed; the failure has been logged.
    Failed(TelemetryKind),
    /// Dropped before reaching a handler.
    Discarded,
}

/// Route one broker message. Never returns an error: every failure is
/// logged and the message dropped.
pub async fn route(monitor: &Monitor, topic: &str, payload: &[u8], received_at: OffsetDateTime) -> RouteOutcome {
    let value: Value = match serde_json::from_slice(payload) {
        Ok(v) => v,
        Err(e) => {
            warn!(%topic, "{}", MonitorError::decode("message", e));
            return RouteOutcome::Discarded;
        }
    };

    let Some(device_id) = extract_device_id(topic) else {
        warn!("{}", MonitorError::MissingDevice(topic.to_string()));
        return RouteOutcome::Discarded;
    };

    // Presence never depends on which handler succeeds.
    monitor.touch(device_id, value.clone(), received_at).await;

    let Some(kind) = classify(topic) else {
        debug!("{}", MonitorError::UnknownKind(topic.to_string()));
        return RouteOutcome::Discarded;
    };

    match dispatch(monitor, kind, device_id, &value, received_at).await {
        Ok(()) => RouteOutcome::Handled(kind),
        Err(e) => {
            warn!(device = %device_id, %kind, "handler failed: {e}");
            RouteOutcome::Failed(kind)
        }
    }
}

async fn dispatch(
    monitor: &Monitor,
    kind: TelemetryKind,
    device_id: &str,
    payload: &Value,
    now: OffsetDateTime,
) -> MonitorResult<()> {
    match kind {
        TelemetryKind::Heartbeat => monitor.handle_heartbeat(device_id, payload, now).await,
        TelemetryKind::Status => monitor.handle_status(device_id, payload, now).await,
        TelemetryKind::Error => monitor.handle_error(device_id, payload, now).await,
        TelemetryKind::Feeding => monitor.handle_feeding(device_id, payload, now).await,
        TelemetryKind::Access => monitor.handle_access(device_id, payload, now).await,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
