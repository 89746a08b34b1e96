//! Byzantine-fault-tolerant ballot aggregation.
//!
//! A ballot of `n` heads tolerates `f` faulty ones. Deny is sticky: it
//! resolves as soon as `2f + 1` heads agree on it, so no coalition of `f`
//! faulty heads can manufacture a veto alone, and under `f = 0` a single
//! honest Deny is final. Allow and Degrade are harder to reach: they need
//! `n - f` matching verdicts, so `f` silent or faulty heads cannot block an
//! honest supermajority but can never be counted in its favor. A ballot
//! where no threshold is met resolves to Split and is escalated by the
//! caller, never silently allowed.

use crate::heads::{GateContext, GateHead};
use aegis_types::{ActionRequest, HeadVerdict, Outcome, Verdict};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Ballot shape: total heads, tolerated faults, and the evaluation deadline
/// after which a head counts as Abstain.
#[derive(Clone, Copy, Debug)]
pub struct QuorumConfig {
    pub n: usize,
    pub f: usize,
    pub deadline: Duration,
}

impl QuorumConfig {
    /// Standard actions: three heads, no tolerated faults, so Allow and
    /// Degrade require unanimity and one Deny is final.
    pub fn standard(deadline: Duration) -> Self {
        Self { n: 3, f: 0, deadline }
    }

    /// High-impact actions: seven heads tolerating two faults.
    pub fn high_impact(deadline: Duration) -> Self {
        Self { n: 7, f: 2, deadline }
    }

    /// Matching verdicts needed for a Deny resolution.
    pub fn deny_threshold(&self) -> usize {
        2 * self.f + 1
    }

    /// Matching verdicts needed for an Allow or Degrade resolution.
    pub fn agree_threshold(&self) -> usize {
        self.n - self.f
    }
}

/// How a ballot resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    Decided(Outcome),
    /// No outcome reached its threshold before the deadline.
    Split,
}

/// A completed ballot: every head's verdict plus the resolution.
#[derive(Clone, Debug)]
pub struct BallotResult {
    pub verdicts: Vec<HeadVerdict>,
    pub resolution: Resolution,
}

impl BallotResult {
    /// Evidence strings from heads that voted Deny, in ballot order.
    pub fn deny_reasons(&self) -> Vec<String> {
        self.verdicts
            .iter()
            .filter(|v| v.verdict == Verdict::Deny)
            .map(|v| v.reason.clone())
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum QuorumError {
    #[error("ballot needs n >= 3f + 1, got n = {n}, f = {f}")]
    InvalidConfig { n: usize, f: usize },

    #[error("roster has {got} heads, ballot requires {want}")]
    RosterMismatch { got: usize, want: usize },
}

/// Fans one request out to every head concurrently and resolves the ballot.
pub struct QuorumEngine {
    heads: Vec<Arc<dyn GateHead>>,
    config: QuorumConfig,
}

impl QuorumEngine {
    pub fn new(heads: Vec<Arc<dyn GateHead>>, config: QuorumConfig) -> Result<Self, QuorumError> {
        if config.n < 3 * config.f + 1 {
            return Err(QuorumError::InvalidConfig {
                n: config.n,
                f: config.f,
            });
        }
        if heads.len() != config.n {
            return Err(QuorumError::RosterMismatch {
                got: heads.len(),
                want: config.n,
            });
        }
        Ok(Self { heads, config })
    }

    pub fn config(&self) -> QuorumConfig {
        self.config
    }

    /// Run the ballot. Heads evaluate concurrently under a shared deadline;
    /// a head that panics, errors, or runs past the deadline is recorded as
    /// Abstain with the miss in its evidence.
    pub async fn evaluate(&self, request: &ActionRequest, ctx: &GateContext) -> BallotResult {
        let futures = self.heads.iter().map(|head| {
            let head = Arc::clone(head);
            let deadline = self.config.deadline;
            async move {
                match tokio::time::timeout(deadline, head.evaluate(request, ctx)).await {
                    Ok(verdict) => verdict,
                    Err(_) => {
                        tracing::warn!(head = head.name(), "head missed ballot deadline");
                        HeadVerdict::new(head.name(), Verdict::Abstain, "ballot_deadline_missed")
                    }
                }
            }
        });
        let verdicts = join_all(futures).await;
        let resolution = resolve(&verdicts, &self.config);
        if resolution == Resolution::Split {
            tracing::warn!(request_id = %request.request_id, "ballot split");
        }
        BallotResult {
            verdicts,
            resolution,
        }
    }
}

/// Pure resolution rule over a finished ballot. Deny is checked first so a
/// quorum of denials always wins over a simultaneous agreement count.
pub fn resolve(verdicts: &[HeadVerdict], config: &QuorumConfig) -> Resolution {
    let count = |v: Verdict| verdicts.iter().filter(|hv| hv.verdict == v).count();

    if count(Verdict::Deny) >= config.deny_threshold() {
        return Resolution::Decided(Outcome::Deny);
    }
    if count(Verdict::Allow) >= config.agree_threshold() {
        return Resolution::Decided(Outcome::Allow);
    }
    if count(Verdict::Degrade) >= config.agree_threshold() {
        return Resolution::Decided(Outcome::Degrade);
    }
    Resolution::Split
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_types::{ActionClass, ActorId, RequestId, Strictness, SystemMode};
    use async_trait::async_trait;

    struct FixedHead {
        name: &'static str,
        verdict: Verdict,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl GateHead for FixedHead {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn evaluate(&self, _request: &ActionRequest, _ctx: &GateContext) -> HeadVerdict {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            HeadVerdict::new(self.name, self.verdict, "fixed")
        }
    }

    fn head(name: &'static str, verdict: Verdict) -> Arc<dyn GateHead> {
        Arc::new(FixedHead {
            name,
            verdict,
            delay: None,
        })
    }

    fn slow_head(name: &'static str, verdict: Verdict, delay: Duration) -> Arc<dyn GateHead> {
        Arc::new(FixedHead {
            name,
            verdict,
            delay: Some(delay),
        })
    }

    fn request() -> ActionRequest {
        ActionRequest {
            request_id: RequestId::generate(),
            actor: ActorId::new("alice"),
            action_kind: "update".to_string(),
            resource: "config".to_string(),
            class: ActionClass::Standard,
            context: serde_json::json!({}),
            signature: vec![],
        }
    }

    fn ctx() -> GateContext {
        GateContext {
            mode: SystemMode::Normal,
            strictness: Strictness::Allow,
            token: None,
            ballot_n: 3,
            high_impact_min_n: 3,
        }
    }

    fn fixed(verdicts: &[Verdict]) -> Vec<HeadVerdict> {
        verdicts
            .iter()
            .map(|v| HeadVerdict::new("h", *v, "fixed"))
            .collect()
    }

    #[test]
    fn single_deny_is_final_at_f_zero() {
        let config = QuorumConfig::standard(Duration::from_millis(50));
        let resolution = resolve(
            &fixed(&[Verdict::Allow, Verdict::Deny, Verdict::Allow]),
            &config,
        );
        assert_eq!(resolution, Resolution::Decided(Outcome::Deny));
    }

    #[test]
    fn allow_requires_unanimity_at_f_zero() {
        let config = QuorumConfig::standard(Duration::from_millis(50));
        assert_eq!(
            resolve(
                &fixed(&[Verdict::Allow, Verdict::Allow, Verdict::Allow]),
                &config
            ),
            Resolution::Decided(Outcome::Allow)
        );
        // One Abstain must never count toward Allow.
        assert_eq!(
            resolve(
                &fixed(&[Verdict::Allow, Verdict::Allow, Verdict::Abstain]),
                &config
            ),
            Resolution::Split
        );
    }

    #[test]
    fn degrade_agreement_resolves_degrade() {
        let config = QuorumConfig::standard(Duration::from_millis(50));
        assert_eq!(
            resolve(
                &fixed(&[Verdict::Degrade, Verdict::Degrade, Verdict::Degrade]),
                &config
            ),
            Resolution::Decided(Outcome::Degrade)
        );
    }

    #[test]
    fn seven_head_ballot_tolerates_two_faults() {
        let config = QuorumConfig::high_impact(Duration::from_millis(50));
        // Five allows out of seven: two faulty heads cannot block.
        assert_eq!(
            resolve(
                &fixed(&[
                    Verdict::Allow,
                    Verdict::Allow,
                    Verdict::Allow,
                    Verdict::Allow,
                    Verdict::Allow,
                    Verdict::Abstain,
                    Verdict::Deny,
                ]),
                &config
            ),
            Resolution::Decided(Outcome::Allow)
        );
        // Four allows against three denies meets neither threshold.
        assert_eq!(
            resolve(
                &fixed(&[
                    Verdict::Allow,
                    Verdict::Allow,
                    Verdict::Allow,
                    Verdict::Allow,
                    Verdict::Deny,
                    Verdict::Deny,
                    Verdict::Deny,
                ]),
                &config
            ),
            Resolution::Split
        );
        // Five denies is a Deny quorum.
        assert_eq!(
            resolve(
                &fixed(&[
                    Verdict::Deny,
                    Verdict::Deny,
                    Verdict::Deny,
                    Verdict::Deny,
                    Verdict::Deny,
                    Verdict::Allow,
                    Verdict::Allow,
                ]),
                &config
            ),
            Resolution::Decided(Outcome::Deny)
        );
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = QuorumConfig {
            n: 3,
            f: 1,
            deadline: Duration::from_millis(50),
        };
        let err = QuorumEngine::new(vec![], config).err().unwrap();
        assert!(matches!(err, QuorumError::InvalidConfig { .. }));

        let config = QuorumConfig::standard(Duration::from_millis(50));
        let err = QuorumEngine::new(vec![head("a", Verdict::Allow)], config)
            .err()
            .unwrap();
        assert!(matches!(err, QuorumError::RosterMismatch { got: 1, want: 3 }));
    }

    proptest::proptest! {
        // Any decided ballot carries at least 2f+1 matching verdicts.
        #[test]
        fn property_decisions_require_matching_quorum(
            raw in proptest::collection::vec(0u8..4, 7),
            f in 0usize..3,
        ) {
            let n = raw.len();
            proptest::prop_assume!(n >= 3 * f + 1);
            let config = QuorumConfig {
                n,
                f,
                deadline: Duration::from_millis(10),
            };
            let verdicts = fixed(
                &raw.iter()
                    .map(|r| match r {
                        0 => Verdict::Allow,
                        1 => Verdict::Deny,
                        2 => Verdict::Degrade,
                        _ => Verdict::Abstain,
                    })
                    .collect::<Vec<_>>(),
            );
            if let Resolution::Decided(outcome) = resolve(&verdicts, &config) {
                let wanted = match outcome {
                    Outcome::Allow => Verdict::Allow,
                    Outcome::Deny => Verdict::Deny,
                    Outcome::Degrade => Verdict::Degrade,
                };
                let matching = verdicts.iter().filter(|v| v.verdict == wanted).count();
                proptest::prop_assert!(matching >= 2 * f + 1);
            }
        }
    }

    #[tokio::test]
    async fn ballot_fans_out_and_resolves() {
        let config = QuorumConfig::standard(Duration::from_millis(200));
        let engine = QuorumEngine::new(
            vec![
                head("a", Verdict::Allow),
                head("b", Verdict::Allow),
                head("c", Verdict::Allow),
            ],
            config,
        )
        .unwrap();
        let result = engine.evaluate(&request(), &ctx()).await;
        assert_eq!(result.resolution, Resolution::Decided(Outcome::Allow));
        assert_eq!(result.verdicts.len(), 3);
    }

    #[tokio::test]
    async fn slow_head_becomes_abstain_not_allow() {
        let config = QuorumConfig::standard(Duration::from_millis(20));
        let engine = QuorumEngine::new(
            vec![
                head("a", Verdict::Allow),
                head("b", Verdict::Allow),
                slow_head("c", Verdict::Allow, Duration::from_secs(5)),
            ],
            config,
        )
        .unwrap();
        let result = engine.evaluate(&request(), &ctx()).await;
        assert_eq!(result.resolution, Resolution::Split);
        let late = result.verdicts.iter().find(|v| v.head == "c").unwrap();
        assert_eq!(late.verdict, Verdict::Abstain);
        assert_eq!(late.reason, "ballot_deadline_missed");
    }

    #[tokio::test]
    async fn deny_reasons_collect_evidence() {
        let config = QuorumConfig::standard(Duration::from_millis(200));
        let engine = QuorumEngine::new(
            vec![
                head("a", Verdict::Deny),
                head("b", Verdict::Allow),
                head("c", Verdict::Deny),
            ],
            config,
        )
        .unwrap();
        let result = engine.evaluate(&request(), &ctx()).await;
        assert_eq!(result.resolution, Resolution::Decided(Outcome::Deny));
        assert_eq!(result.deny_reasons(), vec!["fixed", "fixed"]);
    }
}
