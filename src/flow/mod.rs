//! Flow control: computing the advertised consumption window for a stream
//!
//! The strategy set is closed and chosen at publication creation time from
//! the channel URI (`fc=min` / `fc=max`), defaulting to min-multicast for
//! multi-destination publications and unicast otherwise. Each variant answers
//! the same two questions: where may the sender advance to, and what should
//! happen when a destination joins or leaves.

/// The closed set of window strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControlStrategy {
    /// Single receiver gates the sender directly
    Unicast,
    /// The slowest destination gates the sender; no receiver is overrun
    MinMulticast,
    /// The fastest destination gates the sender; laggards may lose frames
    MaxMulticast,
}

impl FlowControlStrategy {
    /// Resolve a strategy from the channel URI `fc` parameter
    pub fn from_param(param: Option<&str>, multi_destination: bool) -> Self {
        match param {
            Some("min") => FlowControlStrategy::MinMulticast,
            Some("max") => FlowControlStrategy::MaxMulticast,
            Some(other) => {
                tracing::warn!(fc = other, "Unknown flow control strategy, using default");
                Self::default_for(multi_destination)
            }
            None => Self::default_for(multi_destination),
        }
    }

    fn default_for(multi_destination: bool) -> Self {
        if multi_destination {
            FlowControlStrategy::MinMulticast
        } else {
            FlowControlStrategy::Unicast
        }
    }
}

/// A destination joining or leaving the publication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationEvent {
    /// Destination registered; carries its registration id
    Added(i64),
    /// Destination deregistered
    Removed(i64),
}

/// Per-publication flow control state
#[derive(Debug)]
pub struct FlowControl {
    strategy: FlowControlStrategy,
    receiver_count: usize,
}

impl FlowControl {
    /// Create flow control with the given strategy
    pub fn new(strategy: FlowControlStrategy) -> Self {
        Self {
            strategy,
            receiver_count: 0,
        }
    }

    /// Strategy in effect
    pub fn strategy(&self) -> FlowControlStrategy {
        self.strategy
    }

    /// Number of destinations currently registered
    pub fn receiver_count(&self) -> usize {
        self.receiver_count
    }

    /// New position limit given the destinations' receiver positions.
    ///
    /// With no receivers the sender holds at its current position; the
    /// publication reports not-connected in that state anyway.
    pub fn compute_window(
        &self,
        receiver_positions: &[i64],
        sender_position: i64,
        window_length: i64,
    ) -> i64 {
        let gate = match self.strategy {
            FlowControlStrategy::Unicast | FlowControlStrategy::MinMulticast => {
                receiver_positions.iter().copied().min()
            }
            FlowControlStrategy::MaxMulticast => receiver_positions.iter().copied().max(),
        };

        match gate {
            Some(position) => position + window_length,
            None => sender_position,
        }
    }

    /// Track a destination joining or leaving
    pub fn on_destination_event(&mut self, event: DestinationEvent) {
        match event {
            DestinationEvent::Added(id) => {
                self.receiver_count += 1;
                if self.strategy == FlowControlStrategy::Unicast && self.receiver_count > 1 {
                    tracing::warn!(
                        destination_id = id,
                        receivers = self.receiver_count,
                        "Unicast flow control gating multiple destinations"
                    );
                }
            }
            DestinationEvent::Removed(_) => {
                self.receiver_count = self.receiver_count.saturating_sub(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_from_param() {
        assert_eq!(
            FlowControlStrategy::from_param(Some("min"), false),
            FlowControlStrategy::MinMulticast
        );
        assert_eq!(
            FlowControlStrategy::from_param(Some("max"), true),
            FlowControlStrategy::MaxMulticast
        );
        assert_eq!(
            FlowControlStrategy::from_param(None, true),
            FlowControlStrategy::MinMulticast
        );
        assert_eq!(
            FlowControlStrategy::from_param(None, false),
            FlowControlStrategy::Unicast
        );
        // unknown values fall back to the default, never fail
        assert_eq!(
            FlowControlStrategy::from_param(Some("tagged"), true),
            FlowControlStrategy::MinMulticast
        );
    }

    #[test]
    fn test_min_window_gates_on_slowest() {
        let fc = FlowControl::new(FlowControlStrategy::MinMulticast);
        assert_eq!(fc.compute_window(&[100, 400, 250], 500, 1000), 1100);
    }

    #[test]
    fn test_max_window_gates_on_fastest() {
        let fc = FlowControl::new(FlowControlStrategy::MaxMulticast);
        assert_eq!(fc.compute_window(&[100, 400, 250], 500, 1000), 1400);
    }

    #[test]
    fn test_empty_receivers_hold_sender() {
        let fc = FlowControl::new(FlowControlStrategy::MinMulticast);
        assert_eq!(fc.compute_window(&[], 768, 1000), 768);
    }

    #[test]
    fn test_destination_events_track_count() {
        let mut fc = FlowControl::new(FlowControlStrategy::MinMulticast);
        fc.on_destination_event(DestinationEvent::Added(1));
        fc.on_destination_event(DestinationEvent::Added(2));
        assert_eq!(fc.receiver_count(), 2);
        fc.on_destination_event(DestinationEvent::Removed(1));
        assert_eq!(fc.receiver_count(), 1);
        fc.on_destination_event(DestinationEvent::Removed(2));
        fc.on_destination_event(DestinationEvent::Removed(2));
        assert_eq!(fc.receiver_count(), 0);
    }
}
