use std::time::Duration;

use rand::Rng;

pub const DEFAULT_JITTER: f64 = 0.5;

// Result lies in [d, d * (1 + jitter_fraction)].
pub fn jittered(d: Duration, jitter_fraction: f64) -> Duration {
    let jitter = rand::thread_rng().gen::<f64>() * jitter_fraction * d.as_secs_f64();
    d + Duration::from_secs_f64(jitter)
}

// Exponential backoff with jitter; attempts are zero-based.
pub fn delay(attempt: u32, base: Duration, cap: Duration, jitter_fraction: f64) -> Duration {
    let mut backoff = base;
    for _ in 0..attempt {
        backoff *= 2;
        if backoff > cap {
            backoff = cap;
            break;
        }
    }
    jittered(backoff, jitter_fraction)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_stays_within_jitter_bounds() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(2);
        let jitter = 0.5;

        for attempt in 0..8 {
            let floor = std::cmp::min(base * 2u32.pow(attempt), cap);
            let ceiling = floor.mul_f64(1.0 + jitter);

            for _ in 0..50 {
                let d = delay(attempt, base, cap, jitter);
                assert!(d >= floor, "attempt {attempt}: {d:?} below {floor:?}");
                assert!(d <= ceiling, "attempt {attempt}: {d:?} above {ceiling:?}");
            }
        }
    }

    #[test]
    fn zero_jitter_is_exact() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(30);

        assert_eq!(delay(0, base, cap, 0.0), Duration::from_secs(1));
        assert_eq!(delay(1, base, cap, 0.0), Duration::from_secs(2));
        assert_eq!(delay(2, base, cap, 0.0), Duration::from_secs(4));
        assert_eq!(delay(10, base, cap, 0.0), cap);
    }
}
