use chrono::{NaiveDateTime, Utc};

/// Injectable time source. Every component reads time through this so the
/// scenario tests can drive it deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Utc::now().naive_utc()
    }
}

#[cfg(test)]
pub mod test {
    use std::sync::atomic::{AtomicI64, Ordering};

    use chrono::NaiveDateTime;

    use super::Clock;

    /// Test clock advanced by hand.
    pub struct ManualClock {
        millis: AtomicI64,
    }

    impl ManualClock {
        pub fn at(start: NaiveDateTime) -> Self {
            Self {
                millis: AtomicI64::new(start.timestamp_millis()),
            }
        }

        pub fn advance_minutes(&self, minutes: i64) {
            self.millis.fetch_add(minutes * 60_000, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> NaiveDateTime {
            let millis = self.millis.load(Ordering::SeqCst);
            NaiveDateTime::from_timestamp(millis / 1000, ((millis % 1000) * 1_000_000) as u32)
        }
    }
}
