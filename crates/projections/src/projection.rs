//! Core projection trait and position tracking.

use async_trait::async_trait;
use common::GlobalSequenceNumber;
use event_store::EventEnvelope;

use crate::Result;

/// The last global position a projection has confirmed processing.
///
/// Orders before every real position while nothing has been processed, so
/// the minimum over several projections is their low watermark.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProjectionPosition(Option<GlobalSequenceNumber>);

impl ProjectionPosition {
    /// Nothing processed yet.
    pub const fn initial() -> Self {
        Self(None)
    }

    pub fn at(position: GlobalSequenceNumber) -> Self {
        Self(Some(position))
    }

    pub fn last_processed(&self) -> Option<GlobalSequenceNumber> {
        self.0
    }

    /// The first global position not yet processed.
    pub fn next(&self) -> GlobalSequenceNumber {
        self.0.map_or(GlobalSequenceNumber::FIRST, |p| p.next())
    }

    /// Returns true if everything up to and including `target` is processed.
    pub fn has_reached(&self, target: GlobalSequenceNumber) -> bool {
        self.0.is_some_and(|p| p >= target)
    }

    /// Moves forward to `position`; never moves backwards.
    pub fn advance(&self, position: GlobalSequenceNumber) -> Self {
        (*self).max(Self::at(position))
    }
}

impl std::fmt::Display for ProjectionPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(position) => write!(f, "position({position})"),
            None => write!(f, "position(none)"),
        }
    }
}

/// A read-side consumer of the committed log.
///
/// The catch-up worker is the only writer, so implementations need no
/// coordination between `dispatch` and `reset` beyond their own storage.
#[async_trait]
pub trait Projection: Send + Sync {
    /// Returns the name of this projection.
    fn name(&self) -> &'static str;

    /// Applies committed events in ascending global order. Every event is
    /// past this projection's current position.
    async fn dispatch(&self, events: &[EventEnvelope]) -> Result<()>;

    /// Returns the last position this projection has processed. With
    /// `allow_cached`, a cached value may be returned instead of re-reading
    /// durable state.
    async fn low_watermark(&self, allow_cached: bool) -> Result<ProjectionPosition>;

    /// Resets the projection to its initial state.
    async fn reset(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_starts_before_first_event() {
        let pos = ProjectionPosition::initial();
        assert_eq!(pos.last_processed(), None);
        assert_eq!(pos.next(), GlobalSequenceNumber::FIRST);
        assert!(!pos.has_reached(GlobalSequenceNumber::FIRST));
    }

    #[test]
    fn test_position_advances_monotonically() {
        let pos = ProjectionPosition::initial().advance(GlobalSequenceNumber::new(4));
        assert_eq!(pos.next(), GlobalSequenceNumber::new(5));
        assert!(pos.has_reached(GlobalSequenceNumber::new(4)));

        let pos = pos.advance(GlobalSequenceNumber::new(2));
        assert_eq!(pos.last_processed(), Some(GlobalSequenceNumber::new(4)));
    }

    #[test]
    fn test_initial_is_the_lowest_watermark() {
        let positions = [
            ProjectionPosition::at(GlobalSequenceNumber::new(3)),
            ProjectionPosition::initial(),
        ];
        assert_eq!(positions.iter().min(), Some(&ProjectionPosition::initial()));
    }

    #[test]
    fn test_position_display() {
        assert_eq!(
            ProjectionPosition::at(GlobalSequenceNumber::new(42)).to_string(),
            "position(42)"
        );
        assert_eq!(ProjectionPosition::initial().to_string(), "position(none)");
    }
}
