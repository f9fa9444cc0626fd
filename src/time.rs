//! Clocks driving keep-alive and acknowledgment timeouts.
//!
//! Every timer in the session reads an [`embedded_time::Clock`] with
//! millisecond ticks, so tests can swap the wall clock for a [`ManualClock`].

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant as StdInstant,
};

use embedded_time::{
    Clock, Instant,
    clock::Error,
    duration::{Milliseconds, Seconds},
    rate::Fraction,
};

/// Clock bound used throughout the session.
pub trait SessionClock: Clock<T = u64> + Clone + Send + Sync + 'static {}

impl<C> SessionClock for C where C: Clock<T = u64> + Clone + Send + Sync + 'static {}

/// Monotonic wall clock counting milliseconds since its creation.
#[derive(Clone, Debug)]
pub struct StdClock {
    start: StdInstant,
}

impl Default for StdClock {
    fn default() -> Self {
        Self {
            start: StdInstant::now(),
        }
    }
}

impl Clock for StdClock {
    type T = u64;

    const SCALING_FACTOR: Fraction = Fraction::new(1, 1_000);

    fn try_now(&self) -> Result<Instant<Self>, Error> {
        let elapsed = self.start.elapsed().as_millis();

        Ok(Instant::new(u64::try_from(elapsed).unwrap_or(u64::MAX)))
    }
}

/// Clock that only moves when told to.
///
/// Clones share the same counter. With a non-zero step, every reading also
/// advances the counter by that many milliseconds, which lets a worker thread
/// observe time passing without a sleeping test.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
    step: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    pub fn set_auto_advance(&self, step_ms: u64) {
        self.step.store(step_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    type T = u64;

    const SCALING_FACTOR: Fraction = Fraction::new(1, 1_000);

    fn try_now(&self) -> Result<Instant<Self>, Error> {
        let step = self.step.load(Ordering::SeqCst);
        let now = self.now.fetch_add(step, Ordering::SeqCst);

        Ok(Instant::new(now))
    }
}

pub(crate) fn now<C: SessionClock>(clock: &C) -> Instant<C> {
    clock.try_now().unwrap_or_else(|_| Instant::new(0))
}

/// Milliseconds from `since` to `now`; zero if `now` is earlier.
pub(crate) fn elapsed_ms<C: SessionClock>(since: &Instant<C>, now: &Instant<C>) -> u64 {
    now.checked_duration_since(since)
        .and_then(|generic| Milliseconds::<u64>::try_from(generic).ok())
        .map(|ms| ms.0)
        .unwrap_or(0)
}

pub(crate) fn seconds_to_ms(seconds: u64) -> u64 {
    Milliseconds::<u64>::try_from(Seconds(seconds))
        .map(|ms| ms.0)
        .unwrap_or(u64::MAX)
}
