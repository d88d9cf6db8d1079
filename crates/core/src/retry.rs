use std::{future::Future, time::Duration};

use tokio::time::sleep;

/// Exponential backoff schedule: `steps` attempts, the first delay is
/// `duration`, multiplied by `factor` after each attempt, each delay grown by
/// up to `jitter * delay` at random.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub steps: u32,
    pub duration: Duration,
    pub factor: f64,
    pub jitter: f64,
}

/// Schedule used for optimistic writes that hit a conflict.
pub const DEFAULT_RETRY: Backoff =
    Backoff { steps: 5, duration: Duration::from_millis(10), factor: 1.0, jitter: 0.1 };

impl Backoff {
    /// Every field doubled.
    pub fn doubled(self) -> Self {
        Self {
            steps: self.steps * 2,
            duration: self.duration * 2,
            factor: self.factor * 2.0,
            jitter: self.jitter * 2.0,
        }
    }

    /// Delays slept between attempts (one fewer than `steps`), before jitter.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let factor = if self.factor > 0.0 { self.factor } else { 1.0 };
        let mut delay = self.duration;
        (1..self.steps.max(1)).map(move |_| {
            let current = delay;
            delay = delay.mul_f64(factor);
            current
        })
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        delay + delay.mul_f64(rand::random::<f64>() * self.jitter)
    }
}

/// Run `op` until it succeeds, fails with a non-conflict error, or the
/// schedule runs out. The last error is returned when every attempt conflicted.
pub async fn retry_on_conflict<T, E, F, Fut, C>(
    backoff: Backoff,
    is_conflict: C,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
{
    let mut delays = backoff.delays();
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_conflict(&err) => match delays.next() {
                Some(delay) => {
                    tracing::debug!("Conflict on attempt {attempt}, retrying");
                    sleep(backoff.jittered(delay)).await;
                    attempt += 1;
                }
                None => {
                    tracing::warn!("Still conflicting after {attempt} attempts");
                    return Err(err);
                }
            },
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn test_doubled() {
        let doubled = DEFAULT_RETRY.doubled();
        assert_eq!(doubled.steps, 10);
        assert_eq!(doubled.duration, Duration::from_millis(20));
        assert_eq!(doubled.factor, 2.0);
        assert!((doubled.jitter - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn test_delays() {
        let delays = DEFAULT_RETRY.doubled().delays().collect::<Vec<_>>();
        assert_eq!(delays.len(), 9);
        assert_eq!(delays[0], Duration::from_millis(20));
        assert_eq!(delays[1], Duration::from_millis(40));
        assert_eq!(delays[2], Duration::from_millis(80));
        assert_eq!(DEFAULT_RETRY.delays().collect::<Vec<_>>(), [Duration::from_millis(10); 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = retry_on_conflict(DEFAULT_RETRY, |e| *e == "conflict", || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { if n < 3 { Err("conflict") } else { Ok(n) } }
        })
        .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted() {
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = retry_on_conflict(DEFAULT_RETRY, |e| *e == "conflict", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("conflict") }
        })
        .await;
        assert_eq!(result, Err("conflict"));
        assert_eq!(calls.load(Ordering::SeqCst), DEFAULT_RETRY.steps);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_on_other_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = retry_on_conflict(DEFAULT_RETRY, |e| *e == "conflict", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("boom") }
        })
        .await;
        assert_eq!(result, Err("boom"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
