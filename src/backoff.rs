use rand::Rng;
use tokio::time::Duration;

pub trait ExponentialBackoff: Sized {
    fn add_spread(&self, spread: Duration) -> Self;
    fn exponential_backoff(&self, max: Duration) -> Self;
}

impl ExponentialBackoff for Duration {
    fn add_spread(&self, spread: Duration) -> Self {
        let spread = spread.as_nanos();
        if spread == 0 {
            return *self;
        }
        let spread = rand::rng().random_range(0..spread);
        self.saturating_add(Duration::from_nanos(
            u64::try_from(spread).unwrap_or(u64::MAX),
        ))
    }

    fn exponential_backoff(&self, max: Duration) -> Self {
        std::cmp::min(self.saturating_mul(2), max)
    }
}

/// Tracks how long to wait between consecutive failures.
///
/// Each call to [Backoff::wait] sleeps for the current delay and then doubles
/// it, up to a ceiling. [Backoff::reset] returns to the initial delay.
#[derive(Debug)]
pub(crate) struct Backoff {
    min: Duration,
    max: Duration,
    spread: Duration,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(min: Duration, max: Duration, spread: Duration) -> Self {
        let max = std::cmp::max(min, max);
        Self {
            min,
            max,
            spread,
            current: min,
        }
    }

    /// The delay the next call to [Self::wait] will use, before spread.
    pub(crate) fn current(&self) -> Duration {
        self.current
    }

    pub(crate) async fn wait(&mut self) {
        let delay = self.current.add_spread(self.spread);
        self.current = self.current.exponential_backoff(self.max);
        tokio::time::sleep(delay).await;
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.min;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn doubles_up_to_max() {
        let max = Duration::from_secs(5);
        let mut d = Duration::from_millis(10);
        let mut seen = vec![];
        for _ in 0..12 {
            seen.push(d);
            d = d.exponential_backoff(max);
        }
        assert_eq!(seen[0], Duration::from_millis(10));
        assert_eq!(seen[1], Duration::from_millis(20));
        assert_eq!(seen[8], Duration::from_millis(2560));
        assert_eq!(seen[9], max);
        assert_eq!(seen[11], max);
    }

    #[test]
    fn spread_stays_in_range() {
        let base = Duration::from_millis(10);
        assert_eq!(base.add_spread(Duration::ZERO), base);
        for _ in 0..100 {
            let d = base.add_spread(Duration::from_millis(5));
            assert!(d >= base && d < base + Duration::from_millis(5));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn wait_and_reset() {
        let mut backoff = Backoff::new(
            Duration::from_millis(10),
            Duration::from_millis(40),
            Duration::ZERO,
        );

        let start = tokio::time::Instant::now();
        backoff.wait().await;
        assert_eq!(start.elapsed(), Duration::from_millis(10));
        backoff.wait().await;
        backoff.wait().await;
        backoff.wait().await;
        // 10 + 20 + 40 + 40
        assert_eq!(start.elapsed(), Duration::from_millis(110));
        assert_eq!(backoff.current(), Duration::from_millis(40));

        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_millis(10));
    }
}
