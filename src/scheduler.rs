use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Result;

use crate::registry::SpotRegistry;
use crate::task::{StopSignal, TaskHandle};

pub const DEFAULT_RESERVATION_TICK: Duration = Duration::from_secs(1);

/// Periodically returns lapsed reservations to `Available`.
pub struct ReservationScheduler {
    registry: Arc<SpotRegistry>,
    tick: Duration,
}

impl ReservationScheduler {
    pub fn new(registry: Arc<SpotRegistry>, tick: Duration) -> Self {
        Self { registry, tick }
    }

    /// One expiry pass. Returns the ids released.
    pub fn tick(&self, now: SystemTime) -> Vec<String> {
        let expired = self.registry.expire_reservations(now);
        for id in &expired {
            log::info!("reservation for spot {} expired", id);
        }
        expired
    }

    pub fn spawn(self, stop: StopSignal) -> Result<TaskHandle> {
        TaskHandle::spawn("reservation-scheduler", stop, move |stop| {
            log::debug!("reservation scheduler running every {:?}", self.tick);
            while !stop.wait_timeout(self.tick) {
                self.tick(SystemTime::now());
            }
            log::debug!("reservation scheduler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Rect;
    use crate::registry::{SpotDefinition, SpotStatus};

    fn registry() -> Arc<SpotRegistry> {
        let registry = Arc::new(SpotRegistry::new(Duration::from_secs(3)));
        registry
            .define(vec![SpotDefinition::new("P1", Rect::new(0.0, 0.0, 10.0, 10.0))])
            .unwrap();
        registry
    }

    #[test]
    fn tick_releases_only_lapsed_holds() {
        let registry = registry();
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        assert!(registry
            .try_set_reserved("P1", Duration::from_secs(300), t0)
            .is_success());
        let scheduler = ReservationScheduler::new(registry.clone(), DEFAULT_RESERVATION_TICK);

        assert!(scheduler.tick(t0 + Duration::from_secs(300)).is_empty());
        assert_eq!(registry.get("P1").unwrap().status, SpotStatus::Reserved);

        assert_eq!(scheduler.tick(t0 + Duration::from_secs(301)), vec!["P1"]);
        assert_eq!(registry.get("P1").unwrap().status, SpotStatus::Available);
    }

    #[test]
    fn background_loop_expires_reservations() {
        let registry = registry();
        assert!(registry
            .try_set_reserved("P1", Duration::from_millis(10), SystemTime::now())
            .is_success());
        let handle = ReservationScheduler::new(registry.clone(), Duration::from_millis(10))
            .spawn(StopSignal::new())
            .unwrap();
        let mut released = false;
        for _ in 0..200 {
            if registry.get("P1").unwrap().status == SpotStatus::Available {
                released = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        handle.stop().unwrap();
        assert!(released);
    }
}
