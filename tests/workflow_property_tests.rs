//! Property-based tests for the request state machine
//!
//! Random command sequences from a fixed cast of principals are driven through
//! `lifecycle::apply` against an in-memory world. After every step the
//! invariants that must hold regardless of ordering are checked. Storage is
//! left out on purpose: these exercise the pure transition functions only.

use artisan_workflow::{
    WorkflowConfig, WorkflowError,
    estimate::{BillingEstimate, EstimateDecision, EstimateDraft, EstimateStatus, compute_total},
    lifecycle::{self, Command, Outcome, Snapshot},
    request::{DisputeOutcome, RequestDetails, RequestStatus, ServiceRequest},
    types::{AdminId, ArtisanId, ClientId, EstimateId, Principal, RequestId, Side, TimeStamp},
};
use proptest::prelude::*;
use std::collections::HashMap;

// These property tests cover:
//
// 1. Terminal closure - once terminal, a request never changes status
// 2. Stance ratchet - a side's validation or dispute is never overwritten
// 3. Assignment exclusivity - an assigned artisan is only replaced via release
// 4. Idempotence - re-sending an applied command is a no-op
// 5. Price consistency and dual acceptance - every stored estimate verifies
// 6. Version monotonicity - one version and at least one journal entry per write

#[derive(Debug, Clone, Copy)]
enum Actor {
    Owner,
    Stranger,
    Admin,
    ArtisanA,
    ArtisanB,
}

#[derive(Debug, Clone)]
enum Action {
    Issue { unit_price: i64 },
    Respond { accept: bool },
    AcceptAssignment,
    RefuseAssignment,
    Validate { issues: bool },
    Dispute,
    Resolve(DisputeOutcome),
    Cancel,
    Abandon,
    Release,
}

fn actor_strategy() -> impl Strategy<Value = Actor> {
    prop_oneof![
        3 => Just(Actor::Owner),
        1 => Just(Actor::Stranger),
        3 => Just(Actor::Admin),
        2 => Just(Actor::ArtisanA),
        1 => Just(Actor::ArtisanB),
    ]
}

fn action_strategy() -> impl Strategy<Value = Action> {
    prop_oneof![
        (1i64..4).prop_map(|n| Action::Issue { unit_price: n * 2_500 }),
        any::<bool>().prop_map(|accept| Action::Respond { accept }),
        Just(Action::AcceptAssignment),
        Just(Action::RefuseAssignment),
        any::<bool>().prop_map(|issues| Action::Validate { issues }),
        Just(Action::Dispute),
        prop_oneof![
            Just(DisputeOutcome::FavorClient),
            Just(DisputeOutcome::FavorArtisan),
            Just(DisputeOutcome::Split),
            Just(DisputeOutcome::Dismissed),
        ]
        .prop_map(Action::Resolve),
        Just(Action::Cancel),
        Just(Action::Abandon),
        Just(Action::Release),
    ]
}

struct World {
    request: ServiceRequest,
    estimates: HashMap<EstimateId, BillingEstimate>,
    issued: usize,
    now: TimeStamp<chrono::Utc>,
    config: WorkflowConfig,
}

impl World {
    fn new() -> Self {
        let now = TimeStamp::new();
        let request = lifecycle::submit(
            &principal(Actor::Owner),
            RequestId::from("req_prop"),
            RequestDetails::new("plumbing"),
            now,
        )
        .expect("owner can submit");
        Self {
            request,
            estimates: HashMap::new(),
            issued: 0,
            now,
            config: WorkflowConfig::default(),
        }
    }

    fn command(&mut self, action: &Action) -> Option<Command> {
        Some(match action {
            Action::Issue { unit_price } => {
                self.issued += 1;
                Command::IssueEstimate {
                    estimate_id: EstimateId::from(format!("est_{}", self.issued)),
                    draft: EstimateDraft::new().add_line("Labour (hours)", 2, *unit_price),
                }
            }
            Action::Respond { accept } => Command::RespondToEstimate {
                estimate_id: self
                    .request
                    .active_estimate
                    .clone()
                    .or_else(|| self.request.estimate_history.last().cloned())?,
                decision: if *accept {
                    EstimateDecision::Accept
                } else {
                    EstimateDecision::reject("too expensive")
                },
            },
            Action::AcceptAssignment => Command::AcceptAssignment,
            Action::RefuseAssignment => Command::RefuseAssignment,
            Action::Validate { issues } => Command::ValidateCompletion {
                issues: issues.then(|| "grout left on tiles".to_owned()),
            },
            Action::Dispute => Command::Dispute {
                reason: Some("leak is back".into()),
            },
            Action::Resolve(outcome) => Command::ResolveDispute {
                outcome: *outcome,
                note: None,
            },
            Action::Cancel => Command::Cancel { reason: None },
            Action::Abandon => Command::Abandon {
                reason: Some("part unavailable".into()),
            },
            Action::Release => Command::ReleaseAssignment {
                reason: Some("artisan unavailable".into()),
            },
        })
    }

    fn snapshot(&self, command: &Command) -> Snapshot {
        Snapshot {
            request: self.request.clone(),
            estimate: command
                .target_estimate(&self.request)
                .and_then(|id| self.estimates.get(&id).cloned()),
        }
    }

    fn apply(&self, actor: &Principal, command: &Command) -> Result<Outcome, WorkflowError> {
        lifecycle::apply(&self.snapshot(command), actor, command, self.now, &self.config)
    }

    fn commit(&mut self, outcome: Outcome) {
        if let Outcome::Applied { request, estimates } = outcome {
            self.request = request;
            for estimate in estimates {
                self.estimates.insert(estimate.id.clone(), estimate);
            }
        }
    }
}

fn principal(actor: Actor) -> Principal {
    match actor {
        Actor::Owner => Principal::Client(ClientId::from("client_owner")),
        Actor::Stranger => Principal::Client(ClientId::from("client_stranger")),
        Actor::Admin => Principal::Admin(AdminId::from("admin_a")),
        Actor::ArtisanA => Principal::Artisan(ArtisanId::from("artisan_a")),
        Actor::ArtisanB => Principal::Artisan(ArtisanId::from("artisan_b")),
    }
}

fn steps_strategy() -> impl Strategy<Value = Vec<(Actor, Action)>> {
    prop::collection::vec((actor_strategy(), action_strategy()), 1..60)
}

proptest! {
    /// Property: every applied step preserves the workflow invariants, and
    /// re-sending the step afterwards changes nothing.
    #[test]
    fn prop_random_walks_preserve_invariants(steps in steps_strategy()) {
        let mut world = World::new();

        for (actor, action) in steps {
            let Some(command) = world.command(&action) else { continue };
            let actor = principal(actor);
            let before = world.request.clone();

            let Ok(outcome) = world.apply(&actor, &command) else { continue };
            world.commit(outcome.clone());
            let after = &world.request;

            if let Outcome::Applied { .. } = outcome {
                prop_assert_eq!(after.version, before.version + 1, "one version per write");
                prop_assert!(
                    after.journal.len() > before.journal.len(),
                    "every write is journaled"
                );
            } else {
                prop_assert_eq!(&before, after, "no-op must not change the request");
            }

            if before.status.is_terminal() {
                prop_assert_eq!(
                    after.status,
                    before.status,
                    "left terminal state via {:?}",
                    command
                );
            }

            for side in [Side::Client, Side::Artisan] {
                if let Some(stance) = before.validation.stance(side) {
                    prop_assert_eq!(
                        Some(stance),
                        after.validation.stance(side),
                        "{} stance was overwritten", side
                    );
                }
            }

            if let (Some(old), Some(new)) = (&before.assigned_artisan, &after.assigned_artisan) {
                prop_assert_eq!(old, new, "assigned artisan replaced without release");
            }

            for estimate in world.estimates.values() {
                prop_assert!(
                    estimate.verify().is_ok(),
                    "estimate {} failed verification",
                    estimate.id
                );
                if estimate.status() == EstimateStatus::Accepted {
                    prop_assert!(estimate.response(Side::Client).accepted());
                    if estimate.requires_artisan {
                        prop_assert!(estimate.response(Side::Artisan).accepted());
                    }
                }
            }

            if matches!(outcome, Outcome::Applied { .. }) {
                // issuing allocates a fresh id, so replay the exact same command
                let replay = world.apply(&actor, &command);
                prop_assert!(
                    matches!(replay, Ok(Outcome::Unchanged)),
                    "replaying {:?} gave {:?}", command, replay
                );
            }
        }
    }

    /// Property: the stored total always equals the sum over the breakdown.
    #[test]
    fn prop_price_total_matches_breakdown(
        lines in prop::collection::vec((1i64..1_000, 0i64..1_000_000), 1..50)
    ) {
        let draft = lines
            .iter()
            .enumerate()
            .fold(EstimateDraft::new(), |draft, (i, (quantity, unit_price))| {
                draft.add_line(format!("item {i}"), *quantity, *unit_price)
            });
        let expected: i64 = lines.iter().map(|(q, p)| q * p).sum();

        let finalised = draft
            .validate_and_finalise(&WorkflowConfig::default(), TimeStamp::new())
            .expect("well-formed draft");

        prop_assert_eq!(finalised.price_total, expected);
        prop_assert_eq!(compute_total(&finalised.breakdown), Ok(expected));
    }

    /// Property: the same breakdown always fingerprints the same way.
    #[test]
    fn prop_digest_is_deterministic(
        lines in prop::collection::vec((1i64..100, 0i64..10_000), 1..10)
    ) {
        let build = || lines.iter().fold(EstimateDraft::new(), |draft, (q, p)| {
            draft.add_line("line", *q, *p)
        });
        let config = WorkflowConfig::default();
        let now = TimeStamp::new();

        let first = build().validate_and_finalise(&config, now).expect("valid");
        let second = build().validate_and_finalise(&config, now).expect("valid");
        prop_assert_eq!(first.digest, second.digest);
    }

    /// Property: an estimate needing both parties is accepted only once both
    /// accepted, in either order.
    #[test]
    fn prop_dual_acceptance(artisan_first in any::<bool>()) {
        let mut world = World::new();
        let owner = principal(Actor::Owner);
        let admin = principal(Actor::Admin);
        let artisan = principal(Actor::ArtisanA);

        for (actor, action) in [
            (&admin, Action::Issue { unit_price: 5_000 }),
            (&owner, Action::Respond { accept: true }),
            (&artisan, Action::AcceptAssignment),
            (&admin, Action::Issue { unit_price: 7_500 }),
        ] {
            let command = world.command(&action).expect("command");
            let outcome = world.apply(actor, &command).expect("setup step applies");
            world.commit(outcome);
        }
        prop_assert_eq!(world.request.status, RequestStatus::AwaitingEstimateAcceptance);

        let order = if artisan_first { [&artisan, &owner] } else { [&owner, &artisan] };
        let command = world.command(&Action::Respond { accept: true }).expect("command");

        let outcome = world.apply(order[0], &command).expect("first acceptance");
        world.commit(outcome);
        prop_assert_eq!(world.request.status, RequestStatus::AwaitingEstimateAcceptance);

        let outcome = world.apply(order[1], &command).expect("second acceptance");
        world.commit(outcome);
        prop_assert_eq!(world.request.status, RequestStatus::InProgress);

        let active = world.request.active_estimate.clone().expect("active estimate");
        prop_assert!(world.estimates[&active].is_accepted_by_all());
    }
}
