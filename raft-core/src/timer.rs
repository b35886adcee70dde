//! Cancel-and-rearm timer primitive.
//!
//! A `Timer` does not own a task: it is a deadline that the FSM's single
//! `tokio::select!` loop sleeps against (`tokio::time::sleep_until`).
//! Rearming before the deadline is reached simply moves the deadline —
//! there is no separate "cancel" step, since the old deadline is never
//! observed once a later `rearm` call replaces it. A disarmed timer's
//! deadline is pushed far enough into the future that it never fires while
//! the replica has no use for it (e.g. the heartbeat timer on a follower).

use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct Timer {
    deadline: Instant,
}

impl Timer {
    pub fn armed(duration: Duration) -> Self {
        Self {
            deadline: Instant::now() + duration,
        }
    }

    pub fn disarmed() -> Self {
        Self {
            deadline: Instant::now() + Duration::from_secs(3600 * 24 * 365),
        }
    }

    pub fn rearm(&mut self, duration: Duration) {
        self.deadline = Instant::now() + duration;
    }

    pub fn disarm(&mut self) {
        *self = Self::disarmed();
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// Draw a duration uniformly from `[timeout, 2*timeout)`, used to arm the
/// election timer so that split votes are unlikely to repeat.
pub fn randomized_election_timeout(timeout: Duration) -> Duration {
    use rand::Rng;
    let lo = timeout.as_millis() as u64;
    let hi = (timeout.as_millis() as u64).saturating_mul(2).max(lo + 1);
    let millis = rand::thread_rng().gen_range(lo..hi);
    Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn randomized_timeout_stays_in_range() {
        let base = Duration::from_millis(100);
        for _ in 0..200 {
            let d = randomized_election_timeout(base);
            assert!(d >= base);
            assert!(d < base * 2);
        }
    }

    #[tokio::test]
    async fn rearm_moves_the_deadline_forward() {
        let mut t = Timer::armed(Duration::from_millis(10));
        let first = t.deadline();
        tokio::time::sleep(Duration::from_millis(2)).await;
        t.rearm(Duration::from_millis(50));
        assert!(t.deadline() > first);
    }
}
