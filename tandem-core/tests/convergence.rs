//! Property tests for the central correctness claim: replicas that receive
//! the same set of updates render the same text, no matter the delivery
//! order.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tandem_core::{TextReplica, Update, VersionVector};
use uuid::Uuid;

/// Simulated participants edit round-robin, each on its own replica, and
/// periodically catch up on a random prefix of everything published so
/// far. Later edits therefore anchor onto other participants' records
/// (partially-synced states, not just isolated histories). Returns the
/// combined update pool.
fn concurrent_edit_pool(rng: &mut StdRng, participants: usize, ops_each: usize) -> Vec<Update> {
    let mut docs: Vec<TextReplica> = (0..participants)
        .map(|_| TextReplica::new(Uuid::new_v4()))
        .collect();
    let mut pool: Vec<Update> = Vec::new();

    for _ in 0..ops_each {
        for doc in docs.iter_mut() {
            // Pool prefixes are causally closed (an update's origins always
            // precede it), so partial delivery is always valid.
            if !pool.is_empty() && rng.random_range(0..3) == 0 {
                let upto = rng.random_range(0..=pool.len());
                for update in &pool[..upto] {
                    doc.apply_remote(update).expect("no conflicts");
                }
            }

            let len = doc.len();
            let deleting = len > 0 && rng.random_range(0..4) == 0;
            if deleting {
                let offset = rng.random_range(0..len);
                if let Some(update) = doc.delete_at(offset) {
                    pool.push(update);
                }
            } else {
                let offset = if len == 0 { 0 } else { rng.random_range(0..=len) };
                let ch = (b'a' + rng.random_range(0..26) as u8) as char;
                pool.push(doc.insert_at(offset, ch));
            }
        }
    }
    pool
}

fn apply_all(doc: &mut TextReplica, updates: &[Update]) {
    for update in updates {
        doc.apply_remote(update).expect("no conflicts by construction");
    }
    assert_eq!(doc.pending_count(), 0, "every buffered update must resolve");
}

#[test]
fn converges_under_random_interleavings() {
    for seed in 0..20u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let pool = concurrent_edit_pool(&mut rng, 3, 15);

        let mut reference = TextReplica::new(Uuid::new_v4());
        apply_all(&mut reference, &pool);
        let expected = reference.render();

        for _ in 0..5 {
            let mut shuffled = pool.clone();
            shuffled.shuffle(&mut rng);
            let mut doc = TextReplica::new(Uuid::new_v4());
            apply_all(&mut doc, &shuffled);
            assert_eq!(
                doc.render(),
                expected,
                "divergence at seed {seed}"
            );
        }
    }
}

#[test]
fn double_delivery_changes_nothing() {
    let mut rng = StdRng::seed_from_u64(42);
    let pool = concurrent_edit_pool(&mut rng, 2, 10);

    let mut once = TextReplica::new(Uuid::new_v4());
    apply_all(&mut once, &pool);

    let mut twice = TextReplica::new(Uuid::new_v4());
    apply_all(&mut twice, &pool);
    apply_all(&mut twice, &pool);

    assert_eq!(once.render(), twice.render());
    assert_eq!(once.record_count(), twice.record_count());
}

#[test]
fn resync_marker_yields_same_render_as_staying_connected() {
    let mut rng = StdRng::seed_from_u64(7);

    // Authoritative replica sees everything.
    let mut authority = TextReplica::new(Uuid::nil());
    // One client stays connected, the other disconnects halfway.
    let mut steady = TextReplica::new(Uuid::new_v4());
    let mut flaky = TextReplica::new(Uuid::new_v4());

    let pool = concurrent_edit_pool(&mut rng, 3, 12);
    let (first_half, second_half) = pool.split_at(pool.len() / 2);

    for update in first_half {
        authority.apply_remote(update).unwrap();
        steady.apply_remote(update).unwrap();
        flaky.apply_remote(update).unwrap();
    }

    let marker: VersionVector = flaky.version_vector().clone();

    // flaky is offline for the second half.
    for update in second_half {
        authority.apply_remote(update).unwrap();
        steady.apply_remote(update).unwrap();
    }

    // Reconnect: the diff against the stored marker brings flaky level.
    for update in authority.diff_since(&marker) {
        flaky.apply_remote(&update).unwrap();
    }

    assert_eq!(flaky.render(), steady.render());
    assert_eq!(flaky.render(), authority.render());
}

#[test]
fn same_position_inserts_keep_relative_order_everywhere() {
    // Five participants all type a distinct word at offset 0 of an empty
    // document. Every replica must settle on one interleaving.
    let words = ["alpha", "bravo", "charlie", "delta", "echo"];
    let mut pools: Vec<Vec<Update>> = Vec::new();
    for word in words {
        let mut doc = TextReplica::new(Uuid::new_v4());
        pools.push(doc.insert_str_at(0, word));
    }
    let combined: Vec<Update> = pools.concat();

    let mut rng = StdRng::seed_from_u64(99);
    let mut renders = Vec::new();
    for _ in 0..6 {
        let mut shuffled = combined.clone();
        shuffled.shuffle(&mut rng);
        let mut doc = TextReplica::new(Uuid::new_v4());
        apply_all(&mut doc, &shuffled);
        renders.push(doc.render());
    }

    let first = &renders[0];
    assert!(renders.iter().all(|r| r == first));
    for word in words {
        assert!(first.contains(word), "word {word} lost in {first}");
    }
}
