//! Liveness status derivation.
//!
//! All status decisions in the crate go through [`derive_status`]. The
//! rule order is load-bearing: an explicit "no consumer" signal overrides
//! positive counters, and positive traffic outranks a quiet "being
//! watched" state. Edge styling reuses the same function rather than
//! re-deriving the rules, so node and edge status cannot drift apart.

use serde::{Deserialize, Serialize};

/// Liveness tier of a graph entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// No positive signal and not monitored, or explicitly consumer-inactive.
    #[default]
    Inactive,
    /// Monitored but currently quiet.
    Connected,
    /// Recent throughput or message-count signal is positive.
    Active,
}

impl Status {
    /// Returns a short label for display and logging.
    pub fn label(&self) -> &'static str {
        match self {
            Status::Inactive => "INACTIVE",
            Status::Connected => "CONNECTED",
            Status::Active => "ACTIVE",
        }
    }

    /// Palette color for the rendering layer.
    pub fn color(&self) -> &'static str {
        match self {
            Status::Inactive => "#9e9e9e",
            Status::Connected => "#2196f3",
            Status::Active => "#4caf50",
        }
    }
}

/// The independent signals a status is derived from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Signals {
    /// Messages per second reported by the latest metrics sample.
    pub throughput: f64,
    /// Total message count reported (or optimistically incremented).
    pub message_count: u64,
    /// Whether the entity is flagged as monitored.
    pub monitored: bool,
    /// Explicit consumer-liveness flag; `None` until the backend reports it.
    pub consumer_active: Option<bool>,
}

impl Signals {
    /// True when any traffic signal is positive.
    pub fn traffic_positive(&self) -> bool {
        self.throughput > 0.0 || self.message_count > 0
    }

    /// The same signals with traffic zeroed, used to compute an entity's
    /// non-active fallback state.
    fn quiesced(&self) -> Signals {
        Signals {
            throughput: 0.0,
            message_count: 0,
            ..*self
        }
    }
}

/// Derive an entity's status. First matching rule wins:
///
/// 1. explicitly consumer-inactive → [`Status::Inactive`]
/// 2. positive throughput or message count → [`Status::Active`]
/// 3. monitored → [`Status::Connected`]
/// 4. otherwise → [`Status::Inactive`]
pub fn derive_status(signals: &Signals) -> Status {
    if signals.consumer_active == Some(false) {
        return Status::Inactive;
    }
    if signals.traffic_positive() {
        return Status::Active;
    }
    if signals.monitored {
        return Status::Connected;
    }
    Status::Inactive
}

/// Derived presentation state of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeStyle {
    pub status: Status,
    pub animated: bool,
    pub color: &'static str,
}

/// Style an edge from its target node's signals.
///
/// The edge is active (animated, ACTIVE palette) iff the node's traffic
/// signal is positive and live-update mode is on. Otherwise it shows the
/// node's non-active state, computed by deriving status with the traffic
/// signals zeroed: a quiet monitored node's edges read CONNECTED and
/// everything else reads INACTIVE. Animation is suppressed entirely while
/// live mode is off.
pub fn edge_style(signals: &Signals, live_mode: bool) -> EdgeStyle {
    let animated = live_mode && signals.traffic_positive();
    let status = if animated {
        Status::Active
    } else {
        derive_status(&signals.quiesced())
    };
    EdgeStyle {
        status,
        animated,
        color: status.color(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signals(throughput: f64, count: u64, monitored: bool, consumer: Option<bool>) -> Signals {
        Signals {
            throughput,
            message_count: count,
            monitored,
            consumer_active: consumer,
        }
    }

    #[test]
    fn explicit_consumer_inactive_overrides_everything() {
        // Rule 1 beats positive counters and the monitored flag.
        let s = signals(100.0, 5000, true, Some(false));
        assert_eq!(derive_status(&s), Status::Inactive);
    }

    #[test]
    fn positive_traffic_outranks_monitored() {
        assert_eq!(derive_status(&signals(3.0, 0, true, None)), Status::Active);
        assert_eq!(derive_status(&signals(0.0, 1, true, Some(true))), Status::Active);
    }

    #[test]
    fn monitored_but_quiet_is_connected() {
        assert_eq!(derive_status(&signals(0.0, 0, true, None)), Status::Connected);
        assert_eq!(derive_status(&signals(0.0, 0, true, Some(true))), Status::Connected);
    }

    #[test]
    fn default_is_inactive() {
        assert_eq!(derive_status(&Signals::default()), Status::Inactive);
    }

    #[test]
    fn edge_animates_only_in_live_mode() {
        let busy = signals(3.0, 10, true, Some(true));

        let live = edge_style(&busy, true);
        assert!(live.animated);
        assert_eq!(live.status, Status::Active);
        assert_eq!(live.color, Status::Active.color());

        // Same signals with live mode off: no animation, fallback state.
        let off = edge_style(&busy, false);
        assert!(!off.animated);
        assert_eq!(off.status, Status::Connected);
        assert_eq!(off.color, Status::Connected.color());
    }

    #[test]
    fn quiet_unmonitored_edge_is_inactive() {
        let style = edge_style(&signals(0.0, 0, false, None), true);
        assert!(!style.animated);
        assert_eq!(style.status, Status::Inactive);
    }
}
