//! Property tests: replicas that see the same set of updates end up with
//! byte-identical snapshots, whatever the delivery order.

use std::collections::BTreeSet;

use crm_core::{
    Collection, CompanyPatch, ContactPatch, Document, EntityId, NewCompany, NewContact,
};
use proptest::prelude::*;
use proptest::test_runner::Config;

#[derive(Debug, Clone)]
enum Action {
    AddCompany(String),
    AddContact(String),
    Rename { target: usize, name: String },
    Remove { target: usize },
}

fn action() -> impl Strategy<Value = Action> {
    prop_oneof![
        "[a-z]{1,8}".prop_map(Action::AddCompany),
        "[a-z]{1,8}".prop_map(Action::AddContact),
        (0usize..16, "[a-z]{1,8}").prop_map(|(target, name)| Action::Rename { target, name }),
        (0usize..16).prop_map(|target| Action::Remove { target }),
    ]
}

fn clock() -> i64 {
    1_700_000_000_000
}

/// One replica plus the entities it knows about.
struct Peer {
    doc: Document,
    known: Vec<(Collection, EntityId)>,
    deltas: Vec<Vec<u8>>,
    removed: BTreeSet<EntityId>,
}

impl Peer {
    fn new(seed: &[u8], known: &[(Collection, EntityId)]) -> Self {
        let mut doc = Document::new().with_time_source(clock);
        doc.apply(seed).unwrap();
        Self {
            doc,
            known: known.to_vec(),
            deltas: Vec::new(),
            removed: BTreeSet::new(),
        }
    }

    fn target(&self, i: usize) -> (Collection, EntityId) {
        self.known[i % self.known.len()].clone()
    }

    fn run(&mut self, action: &Action) {
        let committed = match action {
            Action::AddCompany(name) => {
                let c = self
                    .doc
                    .mutate(|tx| tx.add_company(NewCompany::new(name.as_str())))
                    .unwrap();
                self.known.push((Collection::Companies, c.output));
                c.update
            }
            Action::AddContact(name) => {
                let c = self
                    .doc
                    .mutate(|tx| tx.add_contact(NewContact::new(name.as_str(), "Test")))
                    .unwrap();
                self.known.push((Collection::Contacts, c.output));
                c.update
            }
            Action::Rename { target: i, name } => {
                let (collection, id) = self.target(*i);
                self.doc
                    .mutate(|tx| match collection {
                        Collection::Contacts => tx.update_contact(
                            &id,
                            ContactPatch {
                                first_name: Some(name.clone()),
                                ..Default::default()
                            },
                        ),
                        _ => tx.update_company(
                            &id,
                            CompanyPatch {
                                name: Some(name.clone()),
                            },
                        ),
                    })
                    .unwrap()
                    .update
            }
            Action::Remove { target: i } => {
                let (collection, id) = self.target(*i);
                let c = self.doc.mutate(|tx| Ok(tx.delete(collection, &id))).unwrap();
                if c.output {
                    self.removed.insert(id);
                }
                c.update
            }
        };
        self.deltas.extend(committed);
    }
}

fn seeded() -> (Vec<u8>, Vec<(Collection, EntityId)>) {
    let mut seed = Document::new().with_time_source(clock);
    let (ids, update) = {
        let c = seed
            .mutate(|tx| {
                Ok(vec![
                    (Collection::Companies, tx.add_company(NewCompany::new("Acme"))?),
                    (Collection::Companies, tx.add_company(NewCompany::new("Globex"))?),
                    (Collection::Contacts, tx.add_contact(NewContact::new("Ann", "Lee"))?),
                ])
            })
            .unwrap();
        (c.output, c.update.unwrap())
    };
    (update, ids)
}

/// Deterministic Fisher-Yates driven by xorshift.
fn shuffled<T: Clone>(items: &[T], mut seed: u64) -> Vec<T> {
    let mut out = items.to_vec();
    seed |= 1;
    for i in (1..out.len()).rev() {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        let j = (seed % (i as u64 + 1)) as usize;
        out.swap(i, j);
    }
    out
}

fn play(script: &[(usize, Action)], peers: usize) -> (Vec<u8>, Vec<Peer>) {
    let (seed, known) = seeded();
    let mut replicas: Vec<Peer> = (0..peers).map(|_| Peer::new(&seed, &known)).collect();
    for (who, action) in script {
        replicas[who % peers].run(action);
    }
    (seed, replicas)
}

proptest! {
    #![proptest_config(Config::with_cases(64))]

    #[test]
    fn prop_delivery_order_does_not_matter(
        script in prop::collection::vec((0usize..3, action()), 1..24),
        order_a in any::<u64>(),
        order_b in any::<u64>(),
    ) {
        let (seed, mut peers) = play(&script, 3);
        let mut all: Vec<Vec<u8>> = vec![seed];
        for peer in &peers {
            all.extend(peer.deltas.iter().cloned());
        }

        let mut x = Document::new();
        for delta in shuffled(&all, order_a) {
            x.apply(&delta).unwrap();
        }
        let mut y = Document::new();
        for delta in shuffled(&all, order_b) {
            y.apply(&delta).unwrap();
        }
        let expected = x.export_snapshot().unwrap();
        prop_assert_eq!(&y.export_snapshot().unwrap(), &expected);

        let per_peer: Vec<Vec<Vec<u8>>> = peers.iter().map(|p| p.deltas.clone()).collect();
        for (i, peer) in peers.iter_mut().enumerate() {
            let others: Vec<Vec<u8>> = per_peer
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .flat_map(|(_, d)| d.iter().cloned())
                .collect();
            for delta in shuffled(&others, order_a ^ i as u64) {
                peer.doc.apply(&delta).unwrap();
            }
            prop_assert_eq!(&peer.doc.export_snapshot().unwrap(), &expected);
        }
    }

    #[test]
    fn prop_duplicate_delivery_is_harmless(
        script in prop::collection::vec((0usize..2, action()), 1..16),
        order in any::<u64>(),
    ) {
        let (seed, peers) = play(&script, 2);
        let mut all: Vec<Vec<u8>> = vec![seed];
        for peer in &peers {
            all.extend(peer.deltas.iter().cloned());
        }

        let mut once = Document::new();
        for delta in &all {
            once.apply(delta).unwrap();
        }
        let mut twice = Document::new();
        let doubled: Vec<Vec<u8>> = all.iter().chain(all.iter()).cloned().collect();
        for delta in shuffled(&doubled, order) {
            twice.apply(&delta).unwrap();
        }
        prop_assert_eq!(once.export_snapshot().unwrap(), twice.export_snapshot().unwrap());
    }

    #[test]
    fn prop_handshake_converges_and_deletes_stick(
        script in prop::collection::vec((0usize..2, action()), 1..24),
    ) {
        let (_, mut peers) = play(&script, 2);
        let removed: BTreeSet<EntityId> = peers
            .iter()
            .flat_map(|p| p.removed.iter().cloned())
            .collect();

        let (left, right) = peers.split_at_mut(1);
        let (a, b) = (&mut left[0].doc, &mut right[0].doc);
        let for_b = a.diff_encoded(&b.state_vector().unwrap()).unwrap();
        let for_a = b.diff_encoded(&a.state_vector().unwrap()).unwrap();
        b.apply(&for_b).unwrap();
        a.apply(&for_a).unwrap();

        prop_assert_eq!(a.version_state(), b.version_state());
        prop_assert_eq!(a.export_snapshot().unwrap(), b.export_snapshot().unwrap());
        for id in &removed {
            for collection in Collection::ALL {
                prop_assert!(a.get(collection, id).is_none());
            }
        }
    }
}
