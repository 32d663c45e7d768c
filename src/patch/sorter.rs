//! Deterministic patch ordering with cycle breaking.
//!
//! [`PatchSorter`] turns one role's registered descriptors into a total
//! execution order. Explicit before/after constraints form a dependency
//! graph between *owners*; within the slack the graph leaves, patches fall
//! back to a stable baseline of priority (descending) then registration
//! index (ascending), so the result depends only on the registrations,
//! never on arrival order.
//!
//! # Architecture
//!
//! Sorting is queue-based rather than a classic topological sort:
//!
//! 1. All nodes enter a queue in baseline order.
//! 2. A node with unsatisfied after-dependencies parks on a waiting list;
//!    otherwise it is emitted, and if it carries before-edges the waiting
//!    list is re-scanned from the front since it may have unblocked parked
//!    nodes.
//! 3. If a drained queue leaves the waiting list non-empty there is a cycle:
//!    exactly one unresolved edge is removed from the *last* parked node and
//!    the waiting list is re-queued. Each round removes one edge, so the
//!    loop always terminates.
//!
//! Broken edges are never an error; they are recorded as diagnostics.
//!
//! The first sorted result is cached. [`PatchSorter::matches`] compares the
//! cached registrations structurally against a new list so callers can skip
//! re-synthesis when nothing changed.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::patch::descriptor::PatchDescriptor;

/// Sorts one role's patch array into execution order.
pub struct PatchSorter {
    patches: Vec<PatchDescriptor>,
    /// Per node: indices that must be emitted before it
    after: Vec<HashSet<usize>>,
    /// Per node: indices that must be emitted after it
    before: Vec<HashSet<usize>>,
    sorted: Option<Vec<usize>>,
    diagnostics: Vec<String>,
}

impl PatchSorter {
    /// Build a sorter over `patches`. Constraints naming owners that are not
    /// registered never materialize as edges.
    #[must_use]
    pub fn new(patches: &[PatchDescriptor]) -> Self {
        let patches: Vec<PatchDescriptor> = patches.to_vec();
        let count = patches.len();

        let mut by_owner: HashMap<&str, Vec<usize>> = HashMap::new();
        for (index, patch) in patches.iter().enumerate() {
            by_owner.entry(patch.owner.as_ref()).or_default().push(index);
        }

        let mut after: Vec<HashSet<usize>> = vec![HashSet::new(); count];
        let mut before: Vec<HashSet<usize>> = vec![HashSet::new(); count];

        for (index, patch) in patches.iter().enumerate() {
            for owner in &patch.before {
                // Everything that owner registered must run after this node.
                for &other in by_owner.get(owner.as_ref()).into_iter().flatten() {
                    if other != index {
                        after[other].insert(index);
                        before[index].insert(other);
                    }
                }
            }
            for owner in &patch.after {
                for &other in by_owner.get(owner.as_ref()).into_iter().flatten() {
                    if other != index {
                        after[index].insert(other);
                        before[other].insert(index);
                    }
                }
            }
        }

        PatchSorter {
            patches,
            after,
            before,
            sorted: None,
            diagnostics: Vec::new(),
        }
    }

    /// The execution order. Computed once and cached.
    pub fn sort(&mut self) -> Vec<PatchDescriptor> {
        if self.sorted.is_none() {
            let order = self.run_sort();
            self.sorted = Some(order);
        }

        self.sorted
            .as_ref()
            .map(|order| order.iter().map(|&i| self.patches[i].clone()).collect())
            .unwrap_or_default()
    }

    /// Structural comparison against a fresh registration list: same patches,
    /// order ignored. A match means the cached sort is still valid.
    #[must_use]
    pub fn matches(&self, patches: &[PatchDescriptor]) -> bool {
        if self.patches.len() != patches.len() {
            return false;
        }
        self.patches.iter().all(|ours| {
            patches.iter().any(|theirs| ours.same_registration(theirs))
        })
    }

    /// Every dependency edge that had to be broken to escape a cycle.
    #[must_use]
    pub fn diagnostics(&self) -> &[String] {
        &self.diagnostics
    }

    fn run_sort(&mut self) -> Vec<usize> {
        let count = self.patches.len();

        let mut baseline: Vec<usize> = (0..count).collect();
        baseline.sort_by(|&a, &b| {
            self.patches[b]
                .priority
                .cmp(&self.patches[a].priority)
                .then(self.patches[a].index.cmp(&self.patches[b].index))
        });

        // Culling mutates edges; keep the registered graph intact.
        let mut after = self.after.clone();
        let mut handled = vec![false; count];
        let mut result = Vec::with_capacity(count);
        let mut queue: VecDeque<usize> = baseline.into_iter().collect();
        let mut waiting: Vec<usize> = Vec::new();

        loop {
            while let Some(node) = queue.pop_front() {
                if after[node].iter().any(|&dep| !handled[dep]) {
                    waiting.push(node);
                    continue;
                }

                handled[node] = true;
                result.push(node);
                if !self.before[node].is_empty() {
                    Self::process_waiting(&mut waiting, &after, &mut handled, &mut result);
                }
            }

            if waiting.is_empty() {
                break;
            }

            self.cull_dependency(&mut after, &waiting, &handled);
            queue = waiting.drain(..).collect();
        }

        result
    }

    /// Re-scan parked nodes front to back; each emission restarts the scan
    /// since it may satisfy an earlier parked node.
    fn process_waiting(
        waiting: &mut Vec<usize>,
        after: &[HashSet<usize>],
        handled: &mut [bool],
        result: &mut Vec<usize>,
    ) {
        let mut index = 0;
        while index < waiting.len() {
            let node = waiting[index];
            if after[node].iter().any(|&dep| !handled[dep]) {
                index += 1;
            } else {
                waiting.remove(index);
                handled[node] = true;
                result.push(node);
                index = 0;
            }
        }
    }

    /// Break a cycle by removing one unresolved edge, taken from the node
    /// parked *last*, which the baseline order makes the deterministic
    /// lowest-stakes victim.
    fn cull_dependency(
        &mut self,
        after: &mut [HashSet<usize>],
        waiting: &[usize],
        handled: &[bool],
    ) {
        for &node in waiting.iter().rev() {
            let Some(&dep) = after[node]
                .iter()
                .find(|&&dep| !handled[dep])
                else {
                    continue;
                };

            after[node].remove(&dep);
            self.diagnostics.push(format!(
                "Cannot sort: removed dependency of '{}' (index {}) on '{}' (index {})",
                self.patches[node].owner,
                self.patches[node].index,
                self.patches[dep].owner,
                self.patches[dep].index,
            ));
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{Token, TypeSig};
    use crate::patch::descriptor::{HookMethod, PatchRole, Priority};

    fn patch(owner: &str, index: u32) -> PatchDescriptor {
        PatchDescriptor::hook(
            owner,
            index,
            PatchRole::Prefix,
            HookMethod {
                token: Token::new(0x0A00_0000 + index),
                params: vec![],
                return_type: TypeSig::Void,
            },
        )
    }

    fn owners(sorted: &[PatchDescriptor]) -> Vec<&str> {
        sorted.iter().map(|p| p.owner.as_ref()).collect()
    }

    #[test]
    fn baseline_is_priority_then_index() {
        let patches = vec![
            patch("low", 0).with_priority(Priority::LOW),
            patch("first", 1).with_priority(Priority::FIRST),
            patch("normal_b", 3),
            patch("normal_a", 2),
        ];

        let sorted = PatchSorter::new(&patches).sort();
        assert_eq!(owners(&sorted), vec!["first", "normal_a", "normal_b", "low"]);
    }

    #[test]
    fn registration_order_is_irrelevant() {
        let mut patches = vec![
            patch("a", 0).with_priority(Priority::HIGH),
            patch("b", 1),
            patch("c", 2).with_after("b"),
            patch("d", 3).with_priority(Priority::LOW),
        ];

        let forward = PatchSorter::new(&patches).sort();
        patches.reverse();
        let reversed = PatchSorter::new(&patches).sort();

        assert_eq!(owners(&forward), owners(&reversed));
    }

    #[test]
    fn before_constraint_beats_priority() {
        let patches = vec![
            patch("late", 0).with_priority(Priority::LAST).with_before("eager"),
            patch("eager", 1).with_priority(Priority::FIRST),
        ];

        let sorted = PatchSorter::new(&patches).sort();
        assert_eq!(owners(&sorted), vec!["late", "eager"]);
    }

    #[test]
    fn after_constraint_parks_until_satisfied() {
        let patches = vec![
            patch("dependent", 0)
                .with_priority(Priority::FIRST)
                .with_after("base"),
            patch("base", 1).with_priority(Priority::LAST),
            patch("middle", 2),
        ];

        let sorted = PatchSorter::new(&patches).sort();
        let order = owners(&sorted);
        let base = order.iter().position(|&o| o == "base").unwrap();
        let dependent = order.iter().position(|&o| o == "dependent").unwrap();
        assert!(base < dependent);
    }

    #[test]
    fn unknown_owners_are_ignored() {
        let patches = vec![
            patch("a", 0).with_after("never_registered"),
            patch("b", 1).with_before("also_missing"),
        ];

        let mut sorter = PatchSorter::new(&patches);
        let sorted = sorter.sort();
        assert_eq!(sorted.len(), 2);
        assert!(sorter.diagnostics().is_empty());
    }

    #[test]
    fn cycles_terminate_with_diagnostics() {
        let patches = vec![
            patch("a", 0).with_after("b"),
            patch("b", 1).with_after("c"),
            patch("c", 2).with_after("a"),
        ];

        let mut sorter = PatchSorter::new(&patches);
        let sorted = sorter.sort();

        assert_eq!(sorted.len(), 3);
        assert!(!sorter.diagnostics().is_empty());

        // Same cycle, same victim, every time.
        let mut again = PatchSorter::new(&patches);
        assert_eq!(owners(&sorter.sort()), owners(&again.sort()));
    }

    #[test]
    fn full_permutation_determinism() {
        let base = vec![
            patch("a", 0).with_priority(Priority::HIGH),
            patch("b", 1).with_after("a"),
            patch("c", 2).with_before("b"),
            patch("d", 3).with_priority(Priority::LOW),
        ];

        let reference = owners(&PatchSorter::new(&base).sort())
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();

        // All 24 permutations of four patches.
        let indices = [0usize, 1, 2, 3];
        for a in indices {
            for b in indices {
                for c in indices {
                    for d in indices {
                        let perm = [a, b, c, d];
                        let mut seen = perm.to_vec();
                        seen.sort_unstable();
                        if seen != [0, 1, 2, 3] {
                            continue;
                        }
                        let shuffled: Vec<PatchDescriptor> =
                            perm.iter().map(|&i| base[i].clone()).collect();
                        assert_eq!(owners(&PatchSorter::new(&shuffled).sort()), reference);
                    }
                }
            }
        }
    }

    #[test]
    fn cache_reuse_via_matches() {
        let patches = vec![patch("a", 0), patch("b", 1).with_after("a")];
        let sorter = PatchSorter::new(&patches);

        let mut reordered = patches.clone();
        reordered.reverse();
        assert!(sorter.matches(&reordered));

        let mut changed = patches.clone();
        changed[0] = patch("a", 0).with_priority(Priority::HIGH);
        assert!(!sorter.matches(&changed));

        let grown = vec![patch("a", 0), patch("b", 1).with_after("a"), patch("c", 2)];
        assert!(!sorter.matches(&grown));
    }
}
