//! Property tests: replicas converge regardless of delivery order.

use proptest::prelude::*;
use tapestry_crdt::{ApplyOutcome, CrdtModel, CrdtSet, CrdtSetOp, Referencable};

#[derive(Debug, Clone, PartialEq)]
struct Tagged {
    id: String,
    writer: String,
    seq: u32,
}

impl Referencable for Tagged {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone)]
enum Intent {
    AddOwn(u8),
    AddShared(u8),
    RemoveOwn(u8),
}

fn intent() -> impl Strategy<Value = Intent> {
    prop_oneof![
        (0u8..3).prop_map(Intent::AddOwn),
        (0u8..2).prop_map(Intent::AddShared),
        (0u8..3).prop_map(Intent::RemoveOwn),
    ]
}

/// Turn intents into ops issued by `actor` against its own replica.
fn issue(actor: &str, intents: &[Intent]) -> Vec<CrdtSetOp<Tagged>> {
    let mut local: CrdtSet<Tagged> = CrdtSet::new();
    let mut ops = Vec::new();
    for (seq, intent) in intents.iter().enumerate() {
        let op = match intent {
            Intent::AddOwn(n) | Intent::AddShared(n) => {
                let id = match intent {
                    Intent::AddOwn(_) => format!("{}-{}", actor, n),
                    _ => format!("shared-{}", n),
                };
                let next = local.version_map().get(actor) + 1;
                CrdtSetOp::Add {
                    actor: actor.to_string(),
                    version_map: local.version_map().with_version(actor, next),
                    added: Tagged {
                        id,
                        writer: actor.to_string(),
                        seq: seq as u32,
                    },
                }
            }
            Intent::RemoveOwn(n) => {
                let id = format!("{}-{}", actor, n);
                match local.get(&id) {
                    Some(existing) => CrdtSetOp::Remove {
                        actor: actor.to_string(),
                        version_map: local.version_map().clone(),
                        removed: existing.clone(),
                    },
                    None => continue,
                }
            }
        };
        local.apply_operation(&op).unwrap();
        ops.push(op);
    }
    ops
}

/// Apply two per-actor op streams, choosing the next stream from `mask`.
fn interleave(
    first: &[CrdtSetOp<Tagged>],
    second: &[CrdtSetOp<Tagged>],
    mask: &[bool],
) -> CrdtSet<Tagged> {
    let mut replica = CrdtSet::new();
    let (mut i, mut j) = (0, 0);
    let mut picks = mask.iter().copied().chain(std::iter::repeat(true));
    while i < first.len() || j < second.len() {
        let take_first = match (i < first.len(), j < second.len()) {
            (true, true) => picks.next().unwrap_or(true),
            (true, false) => true,
            _ => false,
        };
        let op = if take_first {
            i += 1;
            &first[i - 1]
        } else {
            j += 1;
            &second[j - 1]
        };
        replica.apply_operation(op).unwrap();
    }
    replica
}

proptest! {
    #[test]
    fn test_delivery_order_does_not_matter(
        alice in prop::collection::vec(intent(), 0..12),
        bob in prop::collection::vec(intent(), 0..12),
        mask in prop::collection::vec(any::<bool>(), 0..24),
    ) {
        let alice_ops = issue("alice", &alice);
        let bob_ops = issue("bob", &bob);

        let sequential = interleave(&alice_ops, &bob_ops, &[]);
        let shuffled = interleave(&alice_ops, &bob_ops, &mask);
        let reversed = interleave(&bob_ops, &alice_ops, &[]);

        prop_assert_eq!(sequential.data(), shuffled.data());
        prop_assert_eq!(sequential.data(), reversed.data());
    }

    #[test]
    fn test_merge_matches_op_delivery(
        alice in prop::collection::vec(intent(), 0..12),
        bob in prop::collection::vec(intent(), 0..12),
    ) {
        let alice_ops = issue("alice", &alice);
        let bob_ops = issue("bob", &bob);

        let alice_replica = interleave(&alice_ops, &[], &[]);
        let bob_replica = interleave(&[], &bob_ops, &[]);

        let mut left = alice_replica.clone();
        left.merge(bob_replica.data());
        let mut right = bob_replica.clone();
        right.merge(alice_replica.data());

        prop_assert_eq!(left.data(), right.data());
        let combined = interleave(&alice_ops, &bob_ops, &[]);
        prop_assert_eq!(left.data(), combined.data());
    }

    #[test]
    fn test_reapplying_ops_is_redundant(
        alice in prop::collection::vec(intent(), 0..12),
        bob in prop::collection::vec(intent(), 0..12),
    ) {
        let alice_ops = issue("alice", &alice);
        let bob_ops = issue("bob", &bob);
        let mut replica = interleave(&alice_ops, &bob_ops, &[]);
        let before = replica.clone();

        for op in alice_ops.iter().chain(bob_ops.iter()) {
            prop_assert_eq!(replica.apply_operation(op), Ok(ApplyOutcome::Redundant));
        }
        prop_assert_eq!(replica, before);
    }
}
