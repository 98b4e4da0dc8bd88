//! Spot registry: immutable spot geometry plus mutable occupancy status.
//!
//! Every mutation goes through one mutex, so the three writers (occupancy
//! engine, reservation scheduler, reservation requests) are totally ordered per
//! spot. Readers always receive copies.
//!
//! Status rules:
//! - Only `try_set_reserved` moves a spot into `Reserved`.
//! - A detection moves `Available` or `Reserved` into `Occupied`; an arriving
//!   vehicle forfeits whatever hold time remains.
//! - `Occupied` reverts to `Available` only after the release delay has passed
//!   without a detection.
//! - `Reserved` reverts to `Available` once `reserved_until` is in the past.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::geometry::{LineSegment, Point, Rect};

/// Default debounce before an undetected spot reverts to `Available`.
pub const DEFAULT_RELEASE_DELAY: Duration = Duration::from_secs(3);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpotStatus {
    Available,
    Occupied,
    Reserved,
}

impl SpotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Occupied => "occupied",
            Self::Reserved => "reserved",
        }
    }
}

/// Geometry for one spot, as supplied at setup time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpotDefinition {
    pub id: String,
    pub region: Rect,
    /// Optional outline used when rendering the spot mask. Falls back to
    /// `region` when absent.
    #[serde(default)]
    pub polygon: Option<Vec<Point>>,
}

impl SpotDefinition {
    pub fn new(id: impl Into<String>, region: Rect) -> Self {
        Self {
            id: id.into(),
            region,
            polygon: None,
        }
    }

    /// Spots `P1..Pn` in input order, one per drawn line.
    pub fn from_lines(lines: &[LineSegment]) -> Vec<Self> {
        lines
            .iter()
            .enumerate()
            .map(|(i, line)| Self::new(format!("P{}", i + 1), line.bounding_rect()))
            .collect()
    }
}

/// Point-in-time copy of a spot.
#[derive(Clone, Debug, PartialEq)]
pub struct Spot {
    pub id: String,
    pub region: Rect,
    pub polygon: Option<Vec<Point>>,
    pub status: SpotStatus,
    /// Set iff `status == Occupied`.
    pub occupied_since: Option<SystemTime>,
    /// Set iff `status == Reserved`.
    pub reserved_until: Option<SystemTime>,
}

impl Spot {
    fn available(def: SpotDefinition) -> Self {
        Self {
            id: def.id,
            region: def.region,
            polygon: def.polygon,
            status: SpotStatus::Available,
            occupied_since: None,
            reserved_until: None,
        }
    }

    fn set_available(&mut self) {
        self.status = SpotStatus::Available;
        self.occupied_since = None;
        self.reserved_until = None;
    }

    fn set_occupied(&mut self, now: SystemTime) {
        self.status = SpotStatus::Occupied;
        self.occupied_since = Some(now);
        self.reserved_until = None;
    }

    fn set_reserved(&mut self, until: SystemTime) {
        self.status = SpotStatus::Reserved;
        self.occupied_since = None;
        self.reserved_until = Some(until);
    }

    /// Whole seconds left on a reservation, never negative.
    pub fn remaining_hold(&self, now: SystemTime) -> Option<u64> {
        if self.status != SpotStatus::Reserved {
            return None;
        }
        let until = self.reserved_until?;
        Some(until.duration_since(now).map(|d| d.as_secs()).unwrap_or(0))
    }
}

/// Status change produced by one registry mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    pub spot_id: String,
    pub from: SpotStatus,
    pub to: SpotStatus,
}

/// Result of a reservation attempt.
#[derive(Clone, Debug, PartialEq)]
pub enum ReserveOutcome {
    Reserved { until: SystemTime },
    UnknownSpot,
    NotAvailable(SpotStatus),
}

impl ReserveOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Reserved { .. })
    }
}

struct RegistryState {
    spots: Vec<Spot>,
    index: HashMap<String, usize>,
    generation: u64,
}

impl RegistryState {
    fn spot_mut(&mut self, id: &str) -> Option<&mut Spot> {
        let idx = *self.index.get(id)?;
        self.spots.get_mut(idx)
    }
}

pub struct SpotRegistry {
    state: Mutex<RegistryState>,
    release_delay: Duration,
}

impl SpotRegistry {
    pub fn new(release_delay: Duration) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                spots: Vec::new(),
                index: HashMap::new(),
                generation: 0,
            }),
            release_delay,
        }
    }

    pub fn release_delay(&self) -> Duration {
        self.release_delay
    }

    // A panic while holding the lock cannot leave a spot half-updated: each
    // transition is a handful of field stores on one Spot.
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace the whole registry. Every spot starts `Available`.
    pub fn define(&self, definitions: Vec<SpotDefinition>) -> Result<()> {
        let mut index = HashMap::with_capacity(definitions.len());
        for (i, def) in definitions.iter().enumerate() {
            if def.id.trim().is_empty() {
                return Err(anyhow!("spot id must not be empty"));
            }
            if index.insert(def.id.clone(), i).is_some() {
                return Err(anyhow!("duplicate spot id '{}'", def.id));
            }
        }
        let spots = definitions.into_iter().map(Spot::available).collect();

        let mut state = self.lock();
        state.spots = spots;
        state.index = index;
        state.generation += 1;
        log::info!(
            "spot registry defined: {} spots (generation {})",
            state.spots.len(),
            state.generation
        );
        Ok(())
    }

    pub fn define_from_lines(&self, lines: &[LineSegment]) -> Result<()> {
        self.define(SpotDefinition::from_lines(lines))
    }

    pub fn get(&self, id: &str) -> Option<Spot> {
        let state = self.lock();
        state.index.get(id).map(|&idx| state.spots[idx].clone())
    }

    /// All spots in definition order.
    pub fn snapshot(&self) -> Vec<Spot> {
        self.lock().spots.clone()
    }

    pub fn ids(&self) -> Vec<String> {
        self.lock().spots.iter().map(|s| s.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().spots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bumped on every `define`; lets consumers invalidate derived geometry.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Atomic check-and-set into `Reserved`. At most one of any number of
    /// concurrent callers for the same spot can succeed.
    pub fn try_set_reserved(&self, id: &str, hold: Duration, now: SystemTime) -> ReserveOutcome {
        let mut state = self.lock();
        let Some(spot) = state.spot_mut(id) else {
            return ReserveOutcome::UnknownSpot;
        };
        if spot.status != SpotStatus::Available {
            return ReserveOutcome::NotAvailable(spot.status);
        }
        let until = now + hold;
        spot.set_reserved(until);
        ReserveOutcome::Reserved { until }
    }

    /// Apply one spot's detection outcome for the cycle observed at `now`.
    pub fn apply_detection_result(
        &self,
        id: &str,
        occupied: bool,
        now: SystemTime,
    ) -> Option<Transition> {
        let mut state = self.lock();
        let spot = state.spot_mut(id)?;
        apply_to_spot(spot, occupied, now, self.release_delay)
    }

    /// Apply a whole cycle under a single lock acquisition.
    pub fn apply_cycle(&self, results: &[(String, bool)], now: SystemTime) -> Vec<Transition> {
        let mut state = self.lock();
        let mut transitions = Vec::new();
        for (id, occupied) in results {
            if let Some(spot) = state.spot_mut(id) {
                if let Some(t) = apply_to_spot(spot, *occupied, now, self.release_delay) {
                    transitions.push(t);
                }
            }
        }
        transitions
    }

    /// Release every reservation whose hold ended before `now`. Returns the
    /// ids that were released.
    pub fn expire_reservations(&self, now: SystemTime) -> Vec<String> {
        let mut state = self.lock();
        let mut expired = Vec::new();
        for spot in state.spots.iter_mut() {
            if spot.status != SpotStatus::Reserved {
                continue;
            }
            if spot.reserved_until.is_some_and(|until| until < now) {
                spot.set_available();
                expired.push(spot.id.clone());
            }
        }
        expired
    }
}

fn apply_to_spot(
    spot: &mut Spot,
    occupied: bool,
    now: SystemTime,
    release_delay: Duration,
) -> Option<Transition> {
    let from = spot.status;
    if occupied {
        match from {
            SpotStatus::Available | SpotStatus::Reserved => spot.set_occupied(now),
            SpotStatus::Occupied => return None,
        }
    } else {
        if from != SpotStatus::Occupied {
            return None;
        }
        let since = spot.occupied_since.unwrap_or(now);
        let idle = now.duration_since(since).unwrap_or(Duration::ZERO);
        if idle <= release_delay {
            return None;
        }
        spot.set_available();
    }
    Some(Transition {
        spot_id: spot.id.clone(),
        from,
        to: spot.status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::time::UNIX_EPOCH;

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_700_000_000 + secs)
    }

    fn registry() -> SpotRegistry {
        let reg = SpotRegistry::new(Duration::from_secs(3));
        reg.define(vec![
            SpotDefinition::new("P1", Rect::new(100.0, 100.0, 200.0, 200.0)),
            SpotDefinition::new("P2", Rect::new(300.0, 100.0, 400.0, 200.0)),
        ])
        .unwrap();
        reg
    }

    fn assert_invariant(spot: &Spot) {
        match spot.status {
            SpotStatus::Available => {
                assert!(spot.occupied_since.is_none() && spot.reserved_until.is_none())
            }
            SpotStatus::Occupied => {
                assert!(spot.occupied_since.is_some() && spot.reserved_until.is_none())
            }
            SpotStatus::Reserved => {
                assert!(spot.occupied_since.is_none() && spot.reserved_until.is_some())
            }
        }
    }

    #[test]
    fn define_resets_every_spot_and_rejects_duplicates() {
        let reg = registry();
        reg.apply_detection_result("P1", true, at(0));
        assert_eq!(reg.generation(), 1);

        reg.define(vec![SpotDefinition::new("P1", Rect::new(0.0, 0.0, 1.0, 1.0))])
            .unwrap();
        let p1 = reg.get("P1").unwrap();
        assert_eq!(p1.status, SpotStatus::Available);
        assert!(reg.get("P2").is_none());
        assert_eq!(reg.generation(), 2);

        let dup = vec![
            SpotDefinition::new("A", Rect::new(0.0, 0.0, 1.0, 1.0)),
            SpotDefinition::new("A", Rect::new(2.0, 2.0, 3.0, 3.0)),
        ];
        assert!(reg.define(dup).is_err());
        assert_eq!(reg.len(), 1, "failed define must not mutate");
    }

    #[test]
    fn lines_become_numbered_spots() {
        let reg = SpotRegistry::new(DEFAULT_RELEASE_DELAY);
        reg.define_from_lines(&[
            LineSegment { x1: 10.0, y1: 80.0, x2: 60.0, y2: 20.0 },
            LineSegment { x1: 70.0, y1: 20.0, x2: 120.0, y2: 80.0 },
        ])
        .unwrap();
        assert_eq!(reg.ids(), vec!["P1", "P2"]);
        assert_eq!(reg.get("P1").unwrap().region, Rect::new(10.0, 20.0, 60.0, 80.0));
    }

    #[test]
    fn detection_occupies_and_debounces_release() {
        let reg = registry();
        let t = reg.apply_detection_result("P1", true, at(0)).unwrap();
        assert_eq!((t.from, t.to), (SpotStatus::Available, SpotStatus::Occupied));
        assert_eq!(reg.get("P1").unwrap().occupied_since, Some(at(0)));

        // Continued detection keeps the original timestamp.
        assert!(reg.apply_detection_result("P1", true, at(1)).is_none());
        assert_eq!(reg.get("P1").unwrap().occupied_since, Some(at(0)));

        assert!(reg.apply_detection_result("P1", false, at(2)).is_none());
        assert!(reg.apply_detection_result("P1", false, at(3)).is_none());
        let t = reg.apply_detection_result("P1", false, at(4)).unwrap();
        assert_eq!(t.to, SpotStatus::Available);
        let p1 = reg.get("P1").unwrap();
        assert_invariant(&p1);
        assert!(p1.occupied_since.is_none());
    }

    #[test]
    fn reservation_succeeds_once_and_is_overridden_by_detection() {
        let reg = registry();
        let hold = Duration::from_secs(300);
        let outcome = reg.try_set_reserved("P2", hold, at(0));
        assert_eq!(outcome, ReserveOutcome::Reserved { until: at(300) });
        assert_eq!(reg.get("P2").unwrap().remaining_hold(at(0)), Some(300));

        assert_eq!(
            reg.try_set_reserved("P2", hold, at(1)),
            ReserveOutcome::NotAvailable(SpotStatus::Reserved)
        );
        assert_eq!(reg.try_set_reserved("P9", hold, at(1)), ReserveOutcome::UnknownSpot);

        reg.apply_detection_result("P2", true, at(10));
        let p2 = reg.get("P2").unwrap();
        assert_eq!(p2.status, SpotStatus::Occupied);
        assert!(p2.reserved_until.is_none());
        assert_invariant(&p2);
    }

    #[test]
    fn no_detection_leaves_reservation_alone() {
        let reg = registry();
        reg.try_set_reserved("P2", Duration::from_secs(300), at(0));
        assert!(reg.apply_detection_result("P2", false, at(100)).is_none());
        assert_eq!(reg.get("P2").unwrap().status, SpotStatus::Reserved);
    }

    #[test]
    fn expire_releases_only_past_holds() {
        let reg = registry();
        reg.try_set_reserved("P1", Duration::from_secs(10), at(0));
        reg.try_set_reserved("P2", Duration::from_secs(300), at(0));

        assert!(reg.expire_reservations(at(10)).is_empty(), "boundary is exclusive");
        assert_eq!(reg.expire_reservations(at(11)), vec!["P1".to_string()]);
        let p1 = reg.get("P1").unwrap();
        assert_eq!(p1.status, SpotStatus::Available);
        assert_invariant(&p1);
        assert_eq!(reg.get("P2").unwrap().status, SpotStatus::Reserved);

        assert_eq!(reg.expire_reservations(at(301)), vec!["P2".to_string()]);
    }

    #[test]
    fn concurrent_reservations_admit_exactly_one() {
        let reg = Arc::new(registry());
        let threads = 16;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let reg = reg.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    reg.try_set_reserved("P1", Duration::from_secs(60), SystemTime::now())
                        .is_success()
                })
            })
            .collect();
        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(successes, 1);
    }

    #[test]
    fn apply_cycle_reports_transitions() {
        let reg = registry();
        let transitions = reg.apply_cycle(
            &[("P1".to_string(), true), ("P2".to_string(), false), ("P7".to_string(), true)],
            at(0),
        );
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].spot_id, "P1");
    }
}
