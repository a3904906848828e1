// Active Period Tracker: the earliest period every track type is ready to play.

use std::collections::HashSet;
use std::sync::Arc;

use crate::manifest::{Period, TrackType};

#[derive(Debug)]
struct ReadyPeriod {
    period: Arc<Period>,
    ready: HashSet<TrackType>,
}

#[derive(Debug)]
pub struct ActivePeriodTracker {
    track_types: Vec<TrackType>,
    periods: Vec<ReadyPeriod>,
    active: Option<Arc<Period>>,
}

impl ActivePeriodTracker {
    pub fn new(track_types: Vec<TrackType>) -> Self {
        Self {
            track_types,
            periods: Vec::new(),
            active: None,
        }
    }

    pub fn active(&self) -> Option<&Arc<Period>> {
        self.active.as_ref()
    }

    /// Records that `track_type` chose what to load for `period`.
    /// Returns the new active period when it changed.
    pub fn on_ready(&mut self, period: &Arc<Period>, track_type: TrackType) -> Option<Arc<Period>> {
        match self.periods.iter_mut().find(|p| p.period.id == period.id) {
            Some(entry) => {
                entry.ready.insert(track_type);
            }
            None => {
                let at = self
                    .periods
                    .partition_point(|p| p.period.start <= period.start);
                self.periods.insert(
                    at,
                    ReadyPeriod {
                        period: Arc::clone(period),
                        ready: HashSet::from([track_type]),
                    },
                );
            }
        }
        self.refresh()
    }

    /// Records that the chain loading `period` for `track_type` was removed.
    pub fn on_cleared(&mut self, period: &Period, track_type: TrackType) -> Option<Arc<Period>> {
        if let Some(at) = self.periods.iter().position(|p| p.period.id == period.id) {
            self.periods[at].ready.remove(&track_type);
            if self.periods[at].ready.is_empty() {
                self.periods.remove(at);
            }
        }
        self.refresh()
    }

    fn refresh(&mut self) -> Option<Arc<Period>> {
        let candidate = self
            .periods
            .iter()
            .find(|p| self.track_types.iter().all(|t| p.ready.contains(t)))
            .map(|p| Arc::clone(&p.period));
        let changed = match (&candidate, &self.active) {
            (Some(new), Some(old)) => new.id != old.id,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !changed {
            return None;
        }
        self.active = candidate.clone();
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn periods() -> (Arc<Period>, Arc<Period>) {
        (
            Arc::new(Period::new("p0", 0.0, Some(40.0))),
            Arc::new(Period::new("p1", 40.0, Some(80.0))),
        )
    }

    #[test]
    fn test_active_once_every_type_is_ready() {
        let (p0, p1) = periods();
        let mut tracker = ActivePeriodTracker::new(vec![TrackType::Audio, TrackType::Video]);
        assert!(tracker.on_ready(&p0, TrackType::Video).is_none());
        assert_eq!(tracker.on_ready(&p0, TrackType::Audio).unwrap().id, "p0");
        // Already active.
        assert!(tracker.on_ready(&p0, TrackType::Audio).is_none());

        assert!(tracker.on_ready(&p1, TrackType::Video).is_none());
        assert!(tracker.on_ready(&p1, TrackType::Audio).is_none());
        assert_eq!(tracker.active().unwrap().id, "p0");
    }

    #[test]
    fn test_clearing_moves_to_next_period() {
        let (p0, p1) = periods();
        let mut tracker = ActivePeriodTracker::new(vec![TrackType::Video]);
        tracker.on_ready(&p1, TrackType::Video);
        assert_eq!(tracker.on_ready(&p0, TrackType::Video).unwrap().id, "p0");
        assert_eq!(tracker.on_cleared(&p0, TrackType::Video).unwrap().id, "p1");
    }
}
