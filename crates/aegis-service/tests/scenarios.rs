//! End-to-end scenarios across the whole substrate.

use aegis_capability::CapabilityAuthority;
use aegis_commit::CommitCoordinator;
use aegis_crypto::{KeyStore, TimestampAuthority};
use aegis_gate::{
    CapabilityHead, GateContext, GateHead, IdentityHead, InvariantHead, QuorumConfig, QuorumEngine,
};
use aegis_ledger::{
    EntryPayload, InMemoryLedgerStore, Ledger, LedgerConfig, LedgerStore,
};
use aegis_service::{AegisService, ServiceConfig};
use aegis_types::{
    ActionClass, ActionRequest, ActorId, GovernanceError, HeadVerdict, Outcome, RequestId, Scope,
    SystemMode, Verdict, EntityKey,
};
use aegis_waterfall::Waterfall;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

async fn booted_service() -> (AegisService, Arc<InMemoryLedgerStore>) {
    let store = Arc::new(InMemoryLedgerStore::new());
    let service = AegisService::boot(
        Arc::clone(&store) as Arc<dyn LedgerStore>,
        ServiceConfig::default(),
    )
    .await
    .unwrap();
    (service, store)
}

fn signed_request(service: &AegisService, actor: &str, kind: &str, resource: &str) -> ActionRequest {
    let mut request = ActionRequest {
        request_id: RequestId::generate(),
        actor: ActorId::new(actor),
        action_kind: kind.to_string(),
        resource: resource.to_string(),
        class: ActionClass::Standard,
        context: serde_json::json!({}),
        signature: vec![],
    };
    let (_, sig) = service
        .keystore()
        .sign(actor, &request.signing_bytes())
        .unwrap();
    request.signature = sig;
    request
}

#[tokio::test]
async fn valid_token_allows_and_appends_at_next_sequence() {
    let (service, store) = booted_service().await;
    service.keystore().generate("alice").unwrap();
    let token = service
        .capability_authority()
        .issue(
            ActorId::new("alice"),
            Scope::new(["update"], ["config/*"]),
            chrono::Duration::seconds(60),
        )
        .unwrap();

    let before = store.len().await.unwrap();
    let request = signed_request(&service, "alice", "update", "config/network");
    let decision = service.submit_action(request, Some(token)).await.unwrap();

    assert_eq!(decision.outcome, Outcome::Allow);
    assert_eq!(decision.ledger_seq, before);
    assert_eq!(store.len().await.unwrap(), before + 1);
}

#[tokio::test]
async fn expired_token_denies_and_records_the_reason() {
    let (service, store) = booted_service().await;
    service.keystore().generate("alice").unwrap();
    let token = service
        .capability_authority()
        .issue(
            ActorId::new("alice"),
            Scope::new(["update"], ["config/*"]),
            chrono::Duration::seconds(-1),
        )
        .unwrap();

    let request = signed_request(&service, "alice", "update", "config/network");
    let decision = service.submit_action(request, Some(token)).await.unwrap();

    assert_eq!(decision.outcome, Outcome::Deny);
    let entry = store.get(decision.ledger_seq).await.unwrap().unwrap();
    match entry.payload {
        EntryPayload::Decision(record) => {
            assert!(record
                .reasons
                .iter()
                .any(|r| r.contains("capability_expired")));
            assert!(!record.effective);
        }
        other => panic!("expected a decision, got {other:?}"),
    }
}

struct ScriptedHead {
    name: &'static str,
    verdict: Verdict,
    delay: Option<Duration>,
}

#[async_trait]
impl GateHead for ScriptedHead {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn evaluate(&self, _r: &ActionRequest, _c: &GateContext) -> HeadVerdict {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        HeadVerdict::new(self.name, self.verdict, "scripted")
    }
}

#[tokio::test]
async fn unresolved_seven_head_ballot_degrades_with_escalation() {
    let keystore = Arc::new(KeyStore::new());
    keystore.generate("alice").unwrap();
    let store = Arc::new(InMemoryLedgerStore::new());
    let tsa = Arc::new(TimestampAuthority::new(Arc::clone(&keystore)).unwrap());
    let ledger = Arc::new(
        Ledger::open(
            Arc::clone(&store) as Arc<dyn LedgerStore>,
            Arc::clone(&keystore),
            tsa,
            LedgerConfig::default(),
        )
        .await
        .unwrap(),
    );
    let coordinator = Arc::new(CommitCoordinator::new(ledger));

    // Seven heads, f = 2: four respond in time (three Allow, one Deny),
    // three miss the deadline. Neither outcome reaches its threshold.
    let deadline = Duration::from_millis(30);
    let late = Duration::from_secs(2);
    let mut heads: Vec<Arc<dyn GateHead>> = vec![
        Arc::new(ScriptedHead { name: "h0", verdict: Verdict::Allow, delay: None }),
        Arc::new(ScriptedHead { name: "h1", verdict: Verdict::Allow, delay: None }),
        Arc::new(ScriptedHead { name: "h2", verdict: Verdict::Allow, delay: None }),
        Arc::new(ScriptedHead { name: "h3", verdict: Verdict::Deny, delay: None }),
    ];
    for name in ["h4", "h5", "h6"] {
        heads.push(Arc::new(ScriptedHead {
            name,
            verdict: Verdict::Allow,
            delay: Some(late),
        }));
    }
    let engine = Arc::new(
        QuorumEngine::new(heads, QuorumConfig::high_impact(deadline)).unwrap(),
    );
    let mut ballots = HashMap::new();
    ballots.insert(ActionClass::HighImpact, engine);
    let waterfall = Waterfall::new(ballots, coordinator, 7);

    let mut request = ActionRequest {
        request_id: RequestId::generate(),
        actor: ActorId::new("alice"),
        action_kind: "migrate".to_string(),
        resource: "cluster/primary".to_string(),
        class: ActionClass::HighImpact,
        context: serde_json::json!({}),
        signature: vec![],
    };
    let (_, sig) = keystore.sign("alice", &request.signing_bytes()).unwrap();
    request.signature = sig;

    let traversal = waterfall
        .run(&request, SystemMode::Normal, None, EntityKey::new("cluster/primary"))
        .await
        .unwrap();

    assert_eq!(traversal.decision.outcome, Outcome::Degrade);
    assert!(traversal.decision.escalation_required);
    assert!(traversal
        .decision
        .reasons
        .contains(&"quorum_split".to_string()));

    let entry = store
        .get(traversal.decision.ledger_seq)
        .await
        .unwrap()
        .unwrap();
    match entry.payload {
        EntryPayload::Decision(record) => {
            assert_eq!(record.outcome, Outcome::Degrade);
            assert!(record.escalation_required);
        }
        other => panic!("expected a decision, got {other:?}"),
    }
}

#[tokio::test]
async fn tampering_halts_the_system_until_revalidation() {
    let (service, store) = booted_service().await;
    service.keystore().generate("alice").unwrap();
    let token = service
        .capability_authority()
        .issue(
            ActorId::new("alice"),
            Scope::new(["update"], ["config/*"]),
            chrono::Duration::seconds(60),
        )
        .unwrap();
    let request = signed_request(&service, "alice", "update", "config/network");
    let decision = service
        .submit_action(request, Some(token.clone()))
        .await
        .unwrap();

    // Tamper with the committed decision.
    let original = store.get(decision.ledger_seq).await.unwrap().unwrap();
    let mut forged = original.clone();
    if let EntryPayload::Decision(ref mut record) = forged.payload {
        record.outcome = Outcome::Deny;
    }
    store.replace(decision.ledger_seq, forged).unwrap();

    let err = service.audit().await.unwrap_err();
    assert!(matches!(err, GovernanceError::LedgerCorruption(seq) if seq == decision.ledger_seq));
    assert_eq!(service.get_system_mode(), SystemMode::Halted);

    // Mutations are refused, reads are not.
    let request = signed_request(&service, "alice", "update", "config/network");
    let err = service
        .submit_action(request, Some(token.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, GovernanceError::SystemHalted));
    assert!(!service.query_ledger(0, 0).await.unwrap().is_empty());

    // Re-validation fails while the store is still corrupt.
    assert!(service.revalidate().await.is_err());
    assert_eq!(service.get_system_mode(), SystemMode::Halted);

    // Repair, re-validate, resume.
    store.replace(decision.ledger_seq, original).unwrap();
    let mode = service.revalidate().await.unwrap();
    assert_eq!(mode, SystemMode::Normal);
    let request = signed_request(&service, "alice", "update", "config/network");
    let decision = service.submit_action(request, Some(token)).await.unwrap();
    assert_eq!(decision.outcome, Outcome::Allow);
}

#[tokio::test]
async fn replay_against_a_snapshot_reproduces_the_decision_and_hash() {
    let keystore = Arc::new(KeyStore::new());
    keystore.generate("alice").unwrap();
    let authority = Arc::new(CapabilityAuthority::new(Arc::clone(&keystore)).unwrap());
    let tsa = Arc::new(TimestampAuthority::new(Arc::clone(&keystore)).unwrap());

    let build = |store: Arc<InMemoryLedgerStore>| {
        let keystore = Arc::clone(&keystore);
        let authority = Arc::clone(&authority);
        let tsa = Arc::clone(&tsa);
        async move {
            let ledger = Arc::new(
                Ledger::open(
                    store as Arc<dyn LedgerStore>,
                    Arc::clone(&keystore),
                    tsa,
                    LedgerConfig::default(),
                )
                .await
                .unwrap(),
            );
            let heads: Vec<Arc<dyn GateHead>> = vec![
                Arc::new(IdentityHead::new(Arc::clone(&keystore))),
                Arc::new(CapabilityHead::new(authority)),
                Arc::new(InvariantHead::new()),
            ];
            let engine = Arc::new(
                QuorumEngine::new(heads, QuorumConfig::standard(Duration::from_millis(250)))
                    .unwrap(),
            );
            let mut ballots = HashMap::new();
            ballots.insert(ActionClass::Standard, engine);
            Waterfall::new(ballots, Arc::new(CommitCoordinator::new(ledger)), 3)
        }
    };

    let store1 = Arc::new(InMemoryLedgerStore::new());
    let waterfall1 = build(Arc::clone(&store1)).await;

    let token = authority
        .issue(
            ActorId::new("alice"),
            Scope::new(["update"], ["config/*"]),
            chrono::Duration::seconds(300),
        )
        .unwrap();
    let mut request = ActionRequest {
        request_id: RequestId::generate(),
        actor: ActorId::new("alice"),
        action_kind: "update".to_string(),
        resource: "config/network".to_string(),
        class: ActionClass::Standard,
        context: serde_json::json!({"change": "mtu=9000"}),
        signature: vec![],
    };
    let (_, sig) = keystore.sign("alice", &request.signing_bytes()).unwrap();
    request.signature = sig;

    // A few unrelated commits first, then snapshot just before the decision
    // under test is appended.
    for i in 0..3 {
        let mut filler = ActionRequest {
            request_id: RequestId(format!("req-filler-{i}")),
            actor: ActorId::new("alice"),
            action_kind: "update".to_string(),
            resource: format!("config/other-{i}"),
            class: ActionClass::Standard,
            context: serde_json::json!({}),
            signature: vec![],
        };
        let (_, sig) = keystore.sign("alice", &filler.signing_bytes()).unwrap();
        filler.signature = sig;
        waterfall1
            .run(
                &filler,
                SystemMode::Normal,
                Some(token.clone()),
                EntityKey::new(filler.resource.clone()),
            )
            .await
            .unwrap();
    }

    let snapshot_len = store1.len().await.unwrap();
    let snapshot = store1.range(0, snapshot_len - 1).await.unwrap();

    let first = waterfall1
        .run(
            &request,
            SystemMode::Normal,
            Some(token.clone()),
            EntityKey::new("config/network"),
        )
        .await
        .unwrap();

    // Rebuild over the snapshot and replay the identical request.
    let store2 = Arc::new(InMemoryLedgerStore::new());
    for entry in snapshot {
        store2.put(entry).await.unwrap();
    }
    let waterfall2 = build(Arc::clone(&store2)).await;
    let replayed = waterfall2
        .run(
            &request,
            SystemMode::Normal,
            Some(token),
            EntityKey::new("config/network"),
        )
        .await
        .unwrap();

    assert_eq!(replayed.decision.outcome, first.decision.outcome);
    assert_eq!(replayed.decision.reasons, first.decision.reasons);
    assert_eq!(replayed.decision.ledger_seq, first.decision.ledger_seq);

    let original = store1
        .get(first.decision.ledger_seq)
        .await
        .unwrap()
        .unwrap();
    let replay = store2
        .get(replayed.decision.ledger_seq)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(original.self_hash, replay.self_hash);
    assert_eq!(original.prev_hash, replay.prev_hash);
}
