use std::time::Duration;

use crate::system::Clock;

/// How often and how many times a condition is probed before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollPolicy {
    /// Budget for the kernel to expose freshly created partition nodes, about 10 seconds.
    pub const DEVICE_NODES: PollPolicy = PollPolicy {
        interval: Duration::from_millis(200),
        max_attempts: 50,
    };

    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The condition held on the given (1-based) attempt.
    Ready { attempts: u32 },
    /// The condition never held within the budget.
    Exhausted { attempts: u32 },
}

impl PollOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, PollOutcome::Ready { .. })
    }
}

/// Probe `condition` until it holds or the policy's attempts run out, sleeping on `clock` in
/// between. Returns as soon as the condition holds, without a trailing sleep.
pub async fn poll_until<C>(
    policy: PollPolicy,
    clock: &C,
    mut condition: impl FnMut() -> bool,
) -> PollOutcome
where
    C: Clock + ?Sized,
{
    for attempt in 1..=policy.max_attempts {
        if condition() {
            return PollOutcome::Ready { attempts: attempt };
        }
        if attempt < policy.max_attempts {
            clock.sleep(policy.interval).await;
        }
    }
    PollOutcome::Exhausted {
        attempts: policy.max_attempts,
    }
}
