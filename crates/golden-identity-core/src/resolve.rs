//! Identity graph resolution.
//!
//! The current mapping is loaded into a union-find keyed by [`RecordRef`].
//! Records that already share a global id start in one set whose root is
//! labelled with that id. Accepted candidates are unioned in
//! `(left_ref, right_ref)` order, and the result is flushed as a batch of
//! new mapping entries plus one reassignment per retired id.

use std::collections::BTreeMap;

use time::OffsetDateTime;
use tracing::debug;

use crate::config::{ResolutionConfig, ReviewPolicy, SurvivorRule};
use crate::model::{
    GlobalCustomerId, IdentityMapEntry, MatchCandidate, MatchDecision, MergeProposal, RecordRef,
};
use crate::IdentityError;

/// Result of joining the sets of two records.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum UnionOutcome {
    /// Both records were already in one set.
    AlreadyJoined,
    /// Two sets were joined and at most one of them carried a global id.
    Joined,
    /// Two labelled sets were joined; `retired` no longer names a customer.
    Retired {
        retired: GlobalCustomerId,
        surviving: GlobalCustomerId,
    },
}

/// Union-find over source records with per-root global id labels.
#[derive(Debug, Clone, Default)]
pub struct IdentityGraph {
    index: BTreeMap<RecordRef, usize>,
    refs: Vec<RecordRef>,
    parent: Vec<usize>,
    rank: Vec<u32>,
    label: Vec<Option<GlobalCustomerId>>,
    anchors: BTreeMap<GlobalCustomerId, usize>,
    seeded: usize,
}

impl IdentityGraph {
    /// Seeds the graph from the current mapping.
    ///
    /// # Errors
    /// Returns [`IdentityError::Consistency`] when a source record appears
    /// in more than one mapping entry.
    pub fn from_mapping(entries: &[IdentityMapEntry]) -> Result<Self, IdentityError> {
        let mut graph = Self::default();
        for entry in entries {
            if graph.index.contains_key(&entry.record) {
                return Err(IdentityError::Consistency(format!(
                    "source record {} has more than one active global customer id",
                    entry.record
                )));
            }

            let node = graph.insert_node(entry.record.clone());
            match graph.anchors.get(&entry.global_customer_id).copied() {
                Some(anchor) => {
                    let root = graph.find(anchor);
                    graph.link(root, node, Some(entry.global_customer_id));
                }
                None => {
                    graph.label[node] = Some(entry.global_customer_id);
                    graph.anchors.insert(entry.global_customer_id, node);
                }
            }
        }
        graph.seeded = graph.refs.len();
        Ok(graph)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.refs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    /// Joins the sets holding `left` and `right`, adding either record when
    /// it is not yet known. When both sets carry a global id, `rule` picks
    /// the survivor.
    pub fn union(
        &mut self,
        left: &RecordRef,
        right: &RecordRef,
        rule: SurvivorRule,
    ) -> UnionOutcome {
        let left_node = self.node(left);
        let right_node = self.node(right);
        let left_root = self.find(left_node);
        let right_root = self.find(right_node);
        if left_root == right_root {
            return UnionOutcome::AlreadyJoined;
        }

        match (self.label[left_root], self.label[right_root]) {
            (Some(left_id), Some(right_id)) => {
                let (surviving, retired) = match rule {
                    SurvivorRule::LeftOperand => (left_id, right_id),
                    SurvivorRule::OldestId => (left_id.min(right_id), left_id.max(right_id)),
                };
                self.link(left_root, right_root, Some(surviving));
                UnionOutcome::Retired { retired, surviving }
            }
            (left_label, right_label) => {
                self.link(left_root, right_root, left_label.or(right_label));
                UnionOutcome::Joined
            }
        }
    }

    /// Whether both records are known and in one set. Unknown records are
    /// never added.
    pub fn same_cluster(&mut self, left: &RecordRef, right: &RecordRef) -> bool {
        let (Some(left_node), Some(right_node)) =
            (self.index.get(left).copied(), self.index.get(right).copied())
        else {
            return false;
        };
        self.find(left_node) == self.find(right_node)
    }

    /// Global id currently labelling the record's set, if any.
    pub fn global_id_of(&mut self, record: &RecordRef) -> Option<GlobalCustomerId> {
        let node = self.index.get(record).copied()?;
        let root = self.find(node);
        self.label[root]
    }

    /// Surviving id of a seeded global id after all unions so far.
    fn surviving_id_of(&mut self, id: GlobalCustomerId) -> Option<GlobalCustomerId> {
        let anchor = self.anchors.get(&id).copied()?;
        let root = self.find(anchor);
        self.label[root]
    }

    fn insert_node(&mut self, record: RecordRef) -> usize {
        let node = self.refs.len();
        self.index.insert(record.clone(), node);
        self.refs.push(record);
        self.parent.push(node);
        self.rank.push(0);
        self.label.push(None);
        node
    }

    fn node(&mut self, record: &RecordRef) -> usize {
        match self.index.get(record) {
            Some(node) => *node,
            None => self.insert_node(record.clone()),
        }
    }

    fn find(&mut self, node: usize) -> usize {
        let mut root = node;
        while self.parent[root] != root {
            root = self.parent[root];
        }

        let mut cursor = node;
        while self.parent[cursor] != root {
            let next = self.parent[cursor];
            self.parent[cursor] = root;
            cursor = next;
        }
        root
    }

    fn link(&mut self, left_root: usize, right_root: usize, label: Option<GlobalCustomerId>) {
        let (root, child) = if self.rank[left_root] < self.rank[right_root] {
            (right_root, left_root)
        } else {
            (left_root, right_root)
        };
        self.parent[child] = root;
        if self.rank[left_root] == self.rank[right_root] {
            self.rank[root] += 1;
        }
        self.label[child] = None;
        self.label[root] = label;
    }
}

/// Every entry holding `retired_id` moves to `surviving_id`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Reassignment {
    pub retired_id: GlobalCustomerId,
    pub surviving_id: GlobalCustomerId,
    pub affected_records: u32,
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ResolutionPlan {
    pub new_entries: Vec<IdentityMapEntry>,
    pub reassignments: Vec<Reassignment>,
    pub proposals: Vec<MergeProposal>,
    pub processed: usize,
    pub minted: usize,
}

impl ResolutionPlan {
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.new_entries.is_empty() && self.reassignments.is_empty()
    }
}

/// Plans one resolver pass over `candidates` against the `existing`
/// mapping.
///
/// Fresh ids come from `mint` and are only requested for sets that carry no
/// existing id, in order of each set's smallest member. Existing entries
/// are never rewritten except through a [`Reassignment`].
///
/// # Errors
/// Returns [`IdentityError::Consistency`] when `existing` maps one source
/// record twice.
pub fn plan_resolution(
    existing: &[IdentityMapEntry],
    candidates: &[MatchCandidate],
    config: &ResolutionConfig,
    decided_at: OffsetDateTime,
    mut mint: impl FnMut() -> GlobalCustomerId,
) -> Result<ResolutionPlan, IdentityError> {
    let mut graph = IdentityGraph::from_mapping(existing)?;

    let mut ordered: Vec<&MatchCandidate> = candidates
        .iter()
        .filter(|candidate| candidate.decision != MatchDecision::Reject)
        .collect();
    ordered.sort_by(|lhs, rhs| {
        (&lhs.left_ref, &lhs.right_ref).cmp(&(&rhs.left_ref, &rhs.right_ref))
    });

    let mut metadata: BTreeMap<RecordRef, (u32, MatchDecision)> = BTreeMap::new();
    let mut retirements: Vec<GlobalCustomerId> = Vec::new();
    let mut held_back: Vec<&MatchCandidate> = Vec::new();
    let mut processed = 0_usize;

    for candidate in ordered {
        if candidate.decision == MatchDecision::FlagReview
            && config.review_policy == ReviewPolicy::ProposeOnly
        {
            held_back.push(candidate);
            continue;
        }

        processed += 1;
        for record in [&candidate.left_ref, &candidate.right_ref] {
            metadata
                .entry(record.clone())
                .or_insert((candidate.total_score, candidate.decision));
        }

        if let UnionOutcome::Retired { retired, surviving } =
            graph.union(&candidate.left_ref, &candidate.right_ref, config.survivor_rule)
        {
            debug!(
                retired = %retired,
                surviving = %surviving,
                left = %candidate.left_ref,
                right = %candidate.right_ref,
                "merging labelled clusters"
            );
            retirements.push(retired);
        }
    }

    let mut fresh: BTreeMap<usize, GlobalCustomerId> = BTreeMap::new();
    let mut new_entries = Vec::new();
    let records: Vec<(RecordRef, usize)> = graph
        .index
        .iter()
        .map(|(record, node)| (record.clone(), *node))
        .collect();
    for (record, node) in records {
        let root = graph.find(node);
        let global_customer_id = match graph.label[root] {
            Some(id) => id,
            None => *fresh.entry(root).or_insert_with(&mut mint),
        };

        if node < graph.seeded {
            continue;
        }
        let (confidence_score, decision) = metadata
            .get(&record)
            .copied()
            .unwrap_or((0, MatchDecision::AutoMerge));
        new_entries.push(IdentityMapEntry {
            global_customer_id,
            record,
            confidence_score,
            decision,
            decided_at,
        });
    }

    let mut held_counts: BTreeMap<GlobalCustomerId, u32> = BTreeMap::new();
    for entry in existing {
        *held_counts.entry(entry.global_customer_id).or_insert(0) += 1;
    }

    let mut reassignments = Vec::with_capacity(retirements.len());
    for retired_id in retirements {
        let Some(surviving_id) = graph.surviving_id_of(retired_id) else {
            return Err(IdentityError::Consistency(format!(
                "retired global customer id {retired_id} lost its surviving cluster"
            )));
        };
        reassignments.push(Reassignment {
            retired_id,
            surviving_id,
            affected_records: held_counts.get(&retired_id).copied().unwrap_or(0),
        });
    }

    let proposals = held_back
        .into_iter()
        .filter(|candidate| !graph.same_cluster(&candidate.left_ref, &candidate.right_ref))
        .map(|candidate| MergeProposal {
            left_ref: candidate.left_ref.clone(),
            right_ref: candidate.right_ref.clone(),
            total_score: candidate.total_score,
            proposed_at: decided_at,
        })
        .collect();

    Ok(ResolutionPlan {
        new_entries,
        reassignments,
        proposals,
        processed,
        minted: fresh.len(),
    })
}
