//! # Weighted Round-Robin Selection
//!
//! Credit based weighted round robin over a fixed member list.
//!
//! ## Algorithm
//! - Every member starts with `weight` credits (weights at or below zero count as one)
//! - A cursor walks the members cyclically; the first member with credit left is
//!   returned and loses one credit, and the cursor moves past it
//! - When a full sweep finds no credit, all credits are restored and scanning
//!   restarts from the first member
//!
//! Over any window of `sum(weights)` consecutive selections from a fresh state
//! each member is returned exactly `weight` times. For weights `[1, 5, 3]` the
//! sequence is `e1 e2 e3 e2 e3 e2 e3 e2 e2`, then it repeats.
//!
//! Selection takes one short `parking_lot` critical section, so concurrent
//! callers never observe a torn state. Membership never changes in place: a new
//! selector is built instead.

use parking_lot::Mutex;

#[derive(Debug)]
struct SelectionState {
    credits: Vec<u32>,
    cursor: usize,
}

impl SelectionState {
    fn fresh(weights: &[u32]) -> Self {
        Self {
            credits: weights.to_vec(),
            cursor: 0,
        }
    }

    /// Index of the next member with credit, consuming one credit
    fn take_credit(&mut self) -> Option<usize> {
        let n = self.credits.len();
        for offset in 0..n {
            let index = (self.cursor + offset) % n;
            if self.credits[index] > 0 {
                self.credits[index] -= 1;
                self.cursor = (index + 1) % n;
                return Some(index);
            }
        }
        None
    }

    fn reset(&mut self, weights: &[u32]) {
        self.credits.copy_from_slice(weights);
        self.cursor = 0;
    }
}

/// Weighted round robin over members of type `T`
#[derive(Debug)]
pub struct WeightedRoundRobin<T> {
    members: Vec<T>,
    weights: Vec<u32>,
    state: Mutex<SelectionState>,
}

impl<T: Clone> WeightedRoundRobin<T> {
    /// Build a selector from `(member, weight)` pairs
    pub fn new(members: impl IntoIterator<Item = (T, i32)>) -> Self {
        let (members, weights): (Vec<T>, Vec<u32>) = members
            .into_iter()
            .map(|(member, weight)| (member, weight.max(1) as u32))
            .unzip();
        let state = Mutex::new(SelectionState::fresh(&weights));
        Self {
            members,
            weights,
            state,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Sum of effective weights, the length of one full cycle
    pub fn cycle_len(&self) -> u32 {
        self.weights.iter().sum()
    }

    pub fn members(&self) -> &[T] {
        &self.members
    }

    /// Next member, `None` only when there are no members
    pub fn next(&self) -> Option<T> {
        if self.members.is_empty() {
            return None;
        }
        let mut state = self.state.lock();
        let index = match state.take_credit() {
            Some(index) => index,
            None => {
                state.reset(&self.weights);
                state.take_credit()?
            }
        };
        Some(self.members[index].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn selector(weights: &[i32]) -> WeightedRoundRobin<String> {
        WeightedRoundRobin::new(
            weights
                .iter()
                .enumerate()
                .map(|(i, w)| (format!("e{}", i + 1), *w)),
        )
    }

    #[test]
    fn test_reference_sequence() {
        let wrr = selector(&[1, 5, 3]);
        let picks: Vec<String> = (0..18).map(|_| wrr.next().unwrap()).collect();
        let expected = ["e1", "e2", "e3", "e2", "e3", "e2", "e3", "e2", "e2"];
        assert_eq!(&picks[..9], &expected);
        assert_eq!(&picks[9..], &expected);
    }

    #[test]
    fn test_weights_respected_per_cycle() {
        let wrr = selector(&[2, 7, 1, 4]);
        let cycle = wrr.cycle_len() as usize;
        for _ in 0..3 {
            let mut counts: HashMap<String, u32> = HashMap::new();
            for _ in 0..cycle {
                *counts.entry(wrr.next().unwrap()).or_default() += 1;
            }
            assert_eq!(counts["e1"], 2);
            assert_eq!(counts["e2"], 7);
            assert_eq!(counts["e3"], 1);
            assert_eq!(counts["e4"], 4);
        }
    }

    #[test]
    fn test_non_positive_weight_counts_as_one() {
        let wrr = selector(&[0, -3, 2]);
        assert_eq!(wrr.cycle_len(), 4);
        let picks: Vec<String> = (0..4).map(|_| wrr.next().unwrap()).collect();
        assert_eq!(picks, vec!["e1", "e2", "e3", "e3"]);
    }

    #[test]
    fn test_empty_group_returns_none() {
        let wrr: WeightedRoundRobin<String> = WeightedRoundRobin::new(Vec::new());
        assert!(wrr.is_empty());
        assert!(wrr.next().is_none());
    }

    #[test]
    fn test_single_member() {
        let wrr = selector(&[3]);
        for _ in 0..10 {
            assert_eq!(wrr.next().unwrap(), "e1");
        }
    }

    #[test]
    fn test_concurrent_selection_keeps_totals() {
        let wrr = Arc::new(selector(&[1, 5, 3]));
        let threads = 6;
        let per_thread = 9 * 50;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let wrr = wrr.clone();
                std::thread::spawn(move || {
                    let mut counts: HashMap<String, u32> = HashMap::new();
                    for _ in 0..per_thread {
                        *counts.entry(wrr.next().unwrap()).or_default() += 1;
                    }
                    counts
                })
            })
            .collect();

        let mut totals: HashMap<String, u32> = HashMap::new();
        for handle in handles {
            for (name, count) in handle.join().unwrap() {
                *totals.entry(name).or_default() += count;
            }
        }

        // 6 * 450 selections is exactly 300 full cycles
        assert_eq!(totals["e1"], 300);
        assert_eq!(totals["e2"], 1500);
        assert_eq!(totals["e3"], 900);
    }
}
