//! Attach retry policies.
//!
//! Each policy is a pure function from the zero-based attempt number to the
//! time allowed for that attach attempt and the pause that follows a
//! failed one. [`STRATEGIES`] maps the configured policy to its function.

use std::time::Duration;

use serde::{Deserialize, Serialize};

const MIN: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachTimeout {
    /// How long to wait for registration.
    pub attach: Duration,
    /// How long to stay powered down after the attempt fails.
    pub retry_delay: Duration,
}

const fn pair(attach: Duration, retry_delay: Duration) -> AttachTimeout {
    AttachTimeout {
        attach,
        retry_delay,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttachPolicy {
    Fixed,
    Periodic,
    #[default]
    Progressive,
}

impl AttachPolicy {
    pub const ALL: [AttachPolicy; 3] = [
        AttachPolicy::Fixed,
        AttachPolicy::Periodic,
        AttachPolicy::Progressive,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AttachPolicy::Fixed => "fixed",
            AttachPolicy::Periodic => "periodic",
            AttachPolicy::Progressive => "progressive",
        }
    }

    pub fn timeout(self, attempt: u32) -> AttachTimeout {
        strategy(self)(attempt)
    }
}

impl std::fmt::Display for AttachPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AttachPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AttachPolicy::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown attach policy `{s}`"))
    }
}

pub type Strategy = fn(u32) -> AttachTimeout;

pub const STRATEGIES: [(AttachPolicy, Strategy); 3] = [
    (AttachPolicy::Fixed, fixed),
    (AttachPolicy::Periodic, periodic),
    (AttachPolicy::Progressive, progressive),
];

pub fn strategy(policy: AttachPolicy) -> Strategy {
    STRATEGIES
        .iter()
        .find(|(p, _)| *p == policy)
        .map(|(_, f)| *f)
        .unwrap_or(progressive)
}

/// Same window and pause on every attempt.
pub fn fixed(_attempt: u32) -> AttachTimeout {
    pair(5 * MIN, MIN)
}

/// Two back-to-back attempts, then an hour off.
pub fn periodic(attempt: u32) -> AttachTimeout {
    if attempt % 3 == 2 {
        pair(5 * MIN, HOUR)
    } else {
        pair(5 * MIN, Duration::ZERO)
    }
}

const PROGRESSIVE: [AttachTimeout; 9] = [
    pair(MIN, Duration::ZERO),
    pair(Duration::from_secs(5 * 60), Duration::from_secs(5 * 60)),
    pair(Duration::from_secs(45 * 60), HOUR),
    pair(Duration::from_secs(5 * 60), Duration::from_secs(5 * 60)),
    pair(Duration::from_secs(45 * 60), Duration::from_secs(6 * 3600)),
    pair(Duration::from_secs(5 * 60), Duration::from_secs(5 * 60)),
    pair(Duration::from_secs(45 * 60), Duration::from_secs(24 * 3600)),
    pair(Duration::from_secs(5 * 60), Duration::from_secs(5 * 60)),
    pair(Duration::from_secs(45 * 60), Duration::from_secs(168 * 3600)),
];

/// Short attempts first, then long searches separated by pauses that grow
/// to a week; after the table runs out the last two rows repeat.
pub fn progressive(attempt: u32) -> AttachTimeout {
    let idx = attempt as usize;
    if idx < PROGRESSIVE.len() {
        return PROGRESSIVE[idx];
    }
    let tail = &PROGRESSIVE[PROGRESSIVE.len() - 2..];
    tail[(idx - PROGRESSIVE.len()) % 2]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_policy_has_a_strategy() {
        for policy in AttachPolicy::ALL {
            assert!(STRATEGIES.iter().any(|(p, _)| *p == policy), "{policy}");
            assert!(policy.timeout(0).attach > Duration::ZERO);
        }
    }

    #[test]
    fn fixed_never_changes() {
        assert_eq!(fixed(0), fixed(1000));
    }

    #[test]
    fn periodic_pauses_every_third_attempt() {
        assert_eq!(periodic(0).retry_delay, Duration::ZERO);
        assert_eq!(periodic(1).retry_delay, Duration::ZERO);
        assert_eq!(periodic(2).retry_delay, HOUR);
        assert_eq!(periodic(5).retry_delay, HOUR);
    }

    #[test]
    fn progressive_follows_table_then_alternates() {
        assert_eq!(progressive(0), pair(MIN, Duration::ZERO));
        assert_eq!(progressive(2).retry_delay, HOUR);
        assert_eq!(progressive(8).retry_delay, Duration::from_secs(168 * 3600));
        assert_eq!(progressive(9), PROGRESSIVE[7]);
        assert_eq!(progressive(10), PROGRESSIVE[8]);
        assert_eq!(progressive(11), PROGRESSIVE[7]);
        assert!(progressive(u32::MAX).attach > Duration::ZERO);
    }

    #[test]
    fn policy_names_round_trip_through_from_str() {
        for policy in AttachPolicy::ALL {
            assert_eq!(policy.as_str().parse::<AttachPolicy>(), Ok(policy));
        }
        assert!("sometimes".parse::<AttachPolicy>().is_err());
    }
}
