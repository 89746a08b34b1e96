//! The autoimmune dampener: per-source deny-rate tracking.
//!
//! A source (actor or action kind) whose recent submissions are mostly
//! denied gets dampened before the gate plane, so one faulty or adversarial
//! caller cannot exhaust quorum capacity for everyone else. The window is
//! sliding; a dampened source recovers once its old denials age out.

use aegis_types::ActorId;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug)]
pub struct DetectorConfig {
    /// Sliding window over which deny rates are computed.
    pub window: Duration,
    /// Minimum observations before a source can be dampened at all.
    pub min_samples: usize,
    /// Deny rate at or above which the source is dampened.
    pub deny_rate_threshold: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            min_samples: 8,
            deny_rate_threshold: 0.5,
        }
    }
}

#[derive(Default)]
struct DetectorState {
    actors: HashMap<String, VecDeque<(Instant, bool)>>,
    kinds: HashMap<String, VecDeque<(Instant, bool)>>,
}

pub struct FailureDetector {
    config: DetectorConfig,
    state: Mutex<DetectorState>,
}

impl FailureDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            state: Mutex::new(DetectorState::default()),
        }
    }

    /// Record one resolved submission.
    pub fn record(&self, actor: &ActorId, action_kind: &str, denied: bool) {
        let now = Instant::now();
        let Ok(mut state) = self.state.lock() else { return };
        state
            .actors
            .entry(actor.0.clone())
            .or_default()
            .push_back((now, denied));
        state
            .kinds
            .entry(action_kind.to_string())
            .or_default()
            .push_back((now, denied));
    }

    /// Whether submissions from this (actor, action kind) pair should be
    /// rejected before the gate plane. A poisoned lock dampens: fail closed.
    pub fn dampened(&self, actor: &ActorId, action_kind: &str) -> bool {
        let now = Instant::now();
        let Ok(mut state) = self.state.lock() else { return true };
        let config = self.config;

        let over = |samples: Option<&mut VecDeque<(Instant, bool)>>| -> bool {
            let Some(samples) = samples else { return false };
            while let Some((at, _)) = samples.front() {
                if now.duration_since(*at) > config.window {
                    samples.pop_front();
                } else {
                    break;
                }
            }
            if samples.len() < config.min_samples {
                return false;
            }
            let denies = samples.iter().filter(|(_, denied)| *denied).count();
            denies as f64 / samples.len() as f64 >= config.deny_rate_threshold
        };

        over(state.actors.get_mut(&actor.0)) || over(state.kinds.get_mut(action_kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(min_samples: usize) -> FailureDetector {
        FailureDetector::new(DetectorConfig {
            window: Duration::from_secs(60),
            min_samples,
            deny_rate_threshold: 0.5,
        })
    }

    #[test]
    fn quiet_sources_are_not_dampened() {
        let d = detector(4);
        let alice = ActorId::new("alice");
        assert!(!d.dampened(&alice, "update"));
        d.record(&alice, "update", false);
        assert!(!d.dampened(&alice, "update"));
    }

    #[test]
    fn heavy_denial_dampens_the_actor() {
        let d = detector(4);
        let alice = ActorId::new("alice");
        for _ in 0..4 {
            d.record(&alice, "update", true);
        }
        assert!(d.dampened(&alice, "update"));
        // The same actor is dampened on other action kinds too.
        assert!(d.dampened(&alice, "delete"));
        // Other actors submitting other kinds are unaffected.
        assert!(!d.dampened(&ActorId::new("bob"), "read"));
    }

    #[test]
    fn action_kind_dampening_covers_all_actors() {
        let d = detector(4);
        for i in 0..4 {
            d.record(&ActorId::new(format!("actor-{i}")), "flood", true);
        }
        assert!(d.dampened(&ActorId::new("fresh-actor"), "flood"));
    }

    #[test]
    fn below_threshold_rates_pass() {
        let d = detector(4);
        let alice = ActorId::new("alice");
        d.record(&alice, "update", true);
        for _ in 0..5 {
            d.record(&alice, "update", false);
        }
        assert!(!d.dampened(&alice, "update"));
    }

    #[test]
    fn window_expiry_recovers_the_source() {
        let d = FailureDetector::new(DetectorConfig {
            window: Duration::from_millis(0),
            min_samples: 1,
            deny_rate_threshold: 0.5,
        });
        let alice = ActorId::new("alice");
        d.record(&alice, "update", true);
        std::thread::sleep(Duration::from_millis(5));
        assert!(!d.dampened(&alice, "update"));
    }
}
