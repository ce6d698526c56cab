use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct Bucket {
    window_start: Instant,
    count: u32,
}

/// Whole-window token bucket: at most `max_requests` acquisitions per
/// `interval`. The bucket resets wholesale when the window elapses, so a
/// burst of `max_requests` is admitted right after each boundary. Callers
/// over the limit spin-wait until the reset.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: u32,
    interval: Duration,
    stagger: Duration,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, interval: Duration, stagger: Duration) -> Self {
        Self {
            max_requests,
            interval,
            stagger,
            bucket: Mutex::new(Bucket {
                window_start: Instant::now(),
                count: 0,
            }),
        }
    }

    /// Block until a request slot is available. Sleeps a random fraction of
    /// the stagger first so simultaneous callers do not hit the upstream in
    /// one burst.
    pub fn acquire(&self) {
        if !self.stagger.is_zero() {
            thread::sleep(self.stagger.mul_f64(rand::random::<f64>()));
        }
        loop {
            {
                let mut bucket = self.bucket.lock().unwrap();
                if bucket.window_start.elapsed() >= self.interval {
                    bucket.window_start = Instant::now();
                    bucket.count = 0;
                }
                if bucket.count < self.max_requests {
                    bucket.count += 1;
                    return;
                }
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_bucket_passes_without_delay() {
        let limiter = RateLimiter::new(5, Duration::from_secs(60), Duration::ZERO);
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire();
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn excess_request_waits_for_window_boundary() {
        let limiter = RateLimiter::new(2, Duration::from_millis(120), Duration::ZERO);
        let start = Instant::now();
        limiter.acquire();
        limiter.acquire();
        limiter.acquire();
        // the third acquire cannot complete before the window resets
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn window_reset_admits_new_burst() {
        let limiter = RateLimiter::new(2, Duration::from_millis(50), Duration::ZERO);
        limiter.acquire();
        limiter.acquire();
        thread::sleep(Duration::from_millis(60));
        let start = Instant::now();
        limiter.acquire();
        limiter.acquire();
        assert!(start.elapsed() < Duration::from_millis(40));
    }
}
