use std::time::Instant;

/// Source of time for deadlines and measurements.
///
/// Exit events are timestamped with [`Clock::now`] and compared against the deadline, so a
/// scripted clock makes the exit-versus-deadline race deterministic in tests.
#[async_trait::async_trait]
pub trait Clock: std::fmt::Debug + Send + Sync {
    fn now(&self) -> Instant;

    async fn sleep_until(&self, deadline: Instant);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

#[async_trait::async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&self, deadline: Instant) {
        tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
    }
}

#[cfg(test)]
pub mod testing {
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    use super::Clock;

    /// Clock whose readings are scripted. Once the script runs out the last reading repeats.
    /// `sleep_until` never completes, so deadlines only matter through the readings.
    #[derive(Debug)]
    pub struct ScriptedClock {
        origin: Instant,
        readings: Mutex<Vec<Duration>>,
    }

    impl ScriptedClock {
        pub fn new(readings: Vec<Duration>) -> Self {
            let mut readings = readings;
            readings.reverse();
            Self {
                origin: Instant::now(),
                readings: Mutex::new(readings),
            }
        }

        pub fn at(&self, offset: Duration) -> Instant {
            self.origin + offset
        }
    }

    #[async_trait::async_trait]
    impl Clock for ScriptedClock {
        fn now(&self) -> Instant {
            let mut readings = self.readings.lock().unwrap();
            let offset = if readings.len() > 1 {
                readings.pop().unwrap()
            } else {
                readings.last().copied().unwrap_or_default()
            };
            self.origin + offset
        }

        async fn sleep_until(&self, _deadline: Instant) {
            std::future::pending::<()>().await
        }
    }

    #[test]
    fn test_scripted_clock_repeats_last_reading() {
        let clock = ScriptedClock::new(vec![Duration::ZERO, Duration::from_secs(2)]);
        assert_eq!(clock.now(), clock.at(Duration::ZERO));
        assert_eq!(clock.now(), clock.at(Duration::from_secs(2)));
        assert_eq!(clock.now(), clock.at(Duration::from_secs(2)));
    }
}
