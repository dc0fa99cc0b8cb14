//! Correlation / causation bookkeeping.
//!
//! Every causal chain is a tree rooted at the triggering event:
//!
//! ```text
//! Root(correlation=X, causation=None)
//!   └─ Child(correlation=X, causation=Root)
//!        └─ Grandchild(correlation=X, causation=Child)
//! ```
//!
//! These helpers check that a set of events really forms such a forest and
//! rebuild the tree for inspection.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use qcflow_core::EventId;

use crate::DomainEvent;

/// The causal coordinates of one event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct CausalLink {
    pub event_id: EventId,
    pub correlation_id: EventId,
    pub causation_id: Option<EventId>,
}

impl CausalLink {
    pub fn is_root(&self) -> bool {
        self.causation_id.is_none()
    }
}

impl DomainEvent {
    pub fn causal_link(&self) -> CausalLink {
        CausalLink {
            event_id: self.event_id(),
            correlation_id: self.correlation_id(),
            causation_id: self.causation_id(),
        }
    }
}

/// A broken link found by [`verify_chain`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CausalityViolation {
    /// A root event whose correlation id is not its own id.
    RootNotSelfCorrelated { event_id: EventId },
    /// An event that names itself as its cause.
    SelfCaused { event_id: EventId },
    /// The causing event is not part of the examined set.
    MissingParent { event_id: EventId, causation_id: EventId },
    /// The child did not inherit the parent's correlation id.
    CorrelationMismatch { event_id: EventId, expected: EventId, found: EventId },
    /// Parent and child live in different workspaces.
    WorkspaceMismatch { event_id: EventId, parent_id: EventId },
    /// The parent is stamped later than the child.
    ParentAfterChild { event_id: EventId, parent_id: EventId },
    /// Following causation ids from this event leads back to it.
    Cycle { event_id: EventId },
}

/// Check that `events` form a valid causal forest.
///
/// Returns every violation found; an empty vector means the set is valid.
pub fn verify_chain(events: &[DomainEvent]) -> Vec<CausalityViolation> {
    let by_id: HashMap<EventId, &DomainEvent> = events.iter().map(|e| (e.event_id(), e)).collect();
    let mut violations = Vec::new();

    for event in events {
        let event_id = event.event_id();
        let Some(causation_id) = event.causation_id() else {
            if event.correlation_id() != event_id {
                violations.push(CausalityViolation::RootNotSelfCorrelated { event_id });
            }
            continue;
        };

        if causation_id == event_id {
            violations.push(CausalityViolation::SelfCaused { event_id });
            continue;
        }

        let Some(parent) = by_id.get(&causation_id) else {
            violations.push(CausalityViolation::MissingParent { event_id, causation_id });
            continue;
        };

        if parent.correlation_id() != event.correlation_id() {
            violations.push(CausalityViolation::CorrelationMismatch {
                event_id,
                expected: parent.correlation_id(),
                found: event.correlation_id(),
            });
        }
        if parent.workspace_id() != event.workspace_id() {
            violations.push(CausalityViolation::WorkspaceMismatch {
                event_id,
                parent_id: causation_id,
            });
        }
        if parent.occurred_at() > event.occurred_at() {
            violations.push(CausalityViolation::ParentAfterChild {
                event_id,
                parent_id: causation_id,
            });
        }
        if leads_back_to(&by_id, event_id, causation_id) {
            violations.push(CausalityViolation::Cycle { event_id });
        }
    }

    violations
}

/// Walk the ancestors of `event_id`, starting at `parent`, and report whether
/// the walk returns to `event_id`.
fn leads_back_to(by_id: &HashMap<EventId, &DomainEvent>, event_id: EventId, parent: EventId) -> bool {
    let mut seen = HashSet::new();
    let mut current = parent;
    loop {
        if current == event_id {
            return true;
        }
        if !seen.insert(current) {
            return false;
        }
        match by_id.get(&current).and_then(|e| e.causation_id()) {
            Some(next) => current = next,
            None => return false,
        }
    }
}

/// Parent → children adjacency of one causal chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CausalTree {
    root: EventId,
    children: HashMap<EventId, Vec<EventId>>,
}

impl CausalTree {
    pub fn root(&self) -> EventId {
        self.root
    }

    pub fn children(&self, event_id: EventId) -> &[EventId] {
        self.children.get(&event_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Events in depth-first order, root first. Each event is visited once,
    /// even if forged causation ids form a cycle.
    pub fn depth_first(&self) -> Vec<EventId> {
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            out.push(id);
            for child in self.children(id).iter().rev() {
                stack.push(*child);
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.depth_first().len()
    }

    /// A tree always contains at least its root.
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Rebuild the tree rooted at `root` from a (chronologically ordered) set of
/// events. Returns `None` when `root` is not in the set.
///
/// Children keep the order they have in `events`.
pub fn causal_tree(events: &[DomainEvent], root: EventId) -> Option<CausalTree> {
    if !events.iter().any(|e| e.event_id() == root) {
        return None;
    }

    let mut children: HashMap<EventId, Vec<EventId>> = HashMap::new();
    for event in events {
        if let Some(parent) = event.causation_id() {
            children.entry(parent).or_default().push(event.event_id());
        }
    }

    Some(CausalTree { root, children })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use proptest::prelude::*;
    use qcflow_core::{AggregateId, WorkspaceId};
    use serde_json::json;

    fn ws(id: &str) -> WorkspaceId {
        WorkspaceId::new(id).unwrap()
    }

    fn agg(id: &str) -> AggregateId {
        AggregateId::new(id).unwrap()
    }

    fn chain() -> (DomainEvent, DomainEvent, DomainEvent, DomainEvent) {
        let root = DomainEvent::root(ws("ws-1"), agg("task-1"), "QCFailed", json!({}));
        let issue = DomainEvent::caused_by(&root, agg("issue-1"), "IssueCreated", json!({}));
        let assigned = DomainEvent::caused_by(&issue, agg("issue-1"), "TaskAssigned", json!({}));
        let notify = DomainEvent::caused_by(&root, agg("task-1"), "TaskAssigned", json!({}));
        (root, issue, assigned, notify)
    }

    #[test]
    fn well_formed_chain_has_no_violations() {
        let (root, issue, assigned, notify) = chain();
        assert!(verify_chain(&[root, issue, assigned, notify]).is_empty());
    }

    #[test]
    fn detects_missing_parent_and_mismatched_correlation() {
        let (root, issue, assigned, _) = chain();
        let violations = verify_chain(&[root.clone(), assigned.clone()]);
        assert_eq!(
            violations,
            vec![CausalityViolation::MissingParent {
                event_id: assigned.event_id(),
                causation_id: issue.event_id(),
            }]
        );

        // A second root whose child claims the wrong parent chain.
        let other = DomainEvent::root(ws("ws-1"), agg("task-2"), "QCFailed", json!({}));
        let forged: DomainEvent = {
            let mut value = serde_json::to_value(DomainEvent::caused_by(
                &other,
                agg("issue-2"),
                "IssueCreated",
                json!({}),
            ))
            .unwrap();
            value["causation_id"] = serde_json::to_value(root.event_id()).unwrap();
            serde_json::from_value(value).unwrap()
        };
        let violations = verify_chain(&[root.clone(), other, forged.clone()]);
        assert_eq!(
            violations,
            vec![CausalityViolation::CorrelationMismatch {
                event_id: forged.event_id(),
                expected: root.event_id(),
                found: forged.correlation_id(),
            }]
        );
    }

    #[test]
    fn detects_parent_stamped_after_child() {
        let root = DomainEvent::root(ws("ws-1"), agg("task-1"), "QCFailed", json!({}));
        let child = DomainEvent::caused_by(&root, agg("issue-1"), "IssueCreated", json!({}))
            .at(root.occurred_at() - Duration::seconds(5));

        assert_eq!(
            verify_chain(&[root.clone(), child.clone()]),
            vec![CausalityViolation::ParentAfterChild {
                event_id: child.event_id(),
                parent_id: root.event_id(),
            }]
        );
    }

    #[test]
    fn tree_is_rebuilt_depth_first() {
        let (root, issue, assigned, notify) = chain();
        let events = vec![root.clone(), issue.clone(), assigned.clone(), notify.clone()];
        let tree = causal_tree(&events, root.event_id()).unwrap();

        assert_eq!(tree.children(root.event_id()), &[issue.event_id(), notify.event_id()]);
        assert_eq!(
            tree.depth_first(),
            vec![root.event_id(), issue.event_id(), assigned.event_id(), notify.event_id()]
        );
        assert_eq!(tree.len(), 4);
        assert!(causal_tree(&events[1..], root.event_id()).is_none());
    }

    /// Rewrite the stored causation id of `event`, as a tampered document would.
    fn with_causation(event: &DomainEvent, causation: &DomainEvent) -> DomainEvent {
        let mut value = serde_json::to_value(event).unwrap();
        value["causation_id"] = serde_json::to_value(causation.event_id()).unwrap();
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn detects_causation_cycles_longer_than_one() {
        let root = DomainEvent::root(ws("ws-1"), agg("task-1"), "QCFailed", json!({}));
        let first = DomainEvent::caused_by(&root, agg("issue-1"), "IssueCreated", json!({}));
        let second = DomainEvent::caused_by(&first, agg("issue-1"), "TaskAssigned", json!({}));
        let first = with_causation(&first, &second);

        let violations = verify_chain(&[root, first.clone(), second.clone()]);
        assert!(violations.contains(&CausalityViolation::Cycle { event_id: first.event_id() }));
        assert!(violations.contains(&CausalityViolation::Cycle { event_id: second.event_id() }));
    }

    #[test]
    fn walking_a_cyclic_tree_terminates() {
        let root = DomainEvent::root(ws("ws-1"), agg("task-1"), "QCFailed", json!({}));
        let first = DomainEvent::caused_by(&root, agg("issue-1"), "IssueCreated", json!({}));
        let second = DomainEvent::caused_by(&first, agg("issue-1"), "TaskAssigned", json!({}));
        let first = with_causation(&first, &second);
        let events = vec![root, first.clone(), second.clone()];

        let tree = causal_tree(&events, first.event_id()).unwrap();
        assert_eq!(tree.depth_first(), vec![first.event_id(), second.event_id()]);
        assert_eq!(tree.len(), 2);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: any tree grown only through `caused_by` keeps one
        /// correlation id and a valid parent for every non-root event.
        #[test]
        fn trees_built_with_caused_by_are_valid(parents in prop::collection::vec(any::<prop::sample::Index>(), 0..40)) {
            let start = Utc::now();
            let root = DomainEvent::root(ws("ws-1"), agg("task-1"), "QCFailed", json!({})).at(start);
            let mut events = vec![root.clone()];
            for pick in parents {
                let parent = events[pick.index(events.len())].clone();
                events.push(DomainEvent::caused_by(&parent, agg("issue-1"), "IssueCreated", json!({})));
            }

            prop_assert!(verify_chain(&events).is_empty());
            prop_assert!(events.iter().all(|e| e.correlation_id() == root.event_id()));
            let tree = causal_tree(&events, root.event_id()).unwrap();
            prop_assert_eq!(tree.len(), events.len());
        }
    }
}
