use crate::extracts::process::types::{normalize_base_name, Snapshot};
use crate::relationships::family::FamilyIndex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum GroupKind {
    Family,
    NameCluster,
    CommunicationCluster,
    Isolated,
}

impl std::fmt::Display for GroupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GroupKind::Family => write!(f, "family"),
            GroupKind::NameCluster => write!(f, "name-cluster"),
            GroupKind::CommunicationCluster => write!(f, "communication-cluster"),
            GroupKind::Isolated => write!(f, "isolated"),
        }
    }
}

/// Identifies a group within one tick: its kind and its lowest member id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct GroupId {
    pub kind: GroupKind,
    pub anchor: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Group {
    pub id: GroupId,
    /// Sorted ascending
    pub members: Vec<u32>,
    pub leader: u32,
    pub is_isolated: bool,
}

impl Group {
    fn new(kind: GroupKind, mut members: Vec<u32>) -> Option<Self> {
        members.sort_unstable();
        members.dedup();
        let anchor = *members.first()?;
        Some(Self {
            id: GroupId { kind, anchor },
            members,
            leader: anchor,
            is_isolated: kind == GroupKind::Isolated,
        })
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Multi-member groups flock together; isolated entities and singletons do not.
    pub fn flocks(&self) -> bool {
        !self.is_isolated && self.members.len() > 1
    }
}

/// The partition of the live population for one tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupAssignment {
    pub groups: BTreeMap<GroupId, Group>,
    pub membership: HashMap<u32, GroupId>,
}

impl GroupAssignment {
    fn insert(&mut self, group: Group) {
        for &pid in &group.members {
            self.membership.insert(pid, group.id);
        }
        self.groups.insert(group.id, group);
    }

    pub fn group_of(&self, pid: u32) -> Option<&Group> {
        self.membership.get(&pid).and_then(|id| self.groups.get(id))
    }

    pub fn count_by_kind(&self) -> BTreeMap<GroupKind, usize> {
        let mut counts = BTreeMap::new();
        for id in self.groups.keys() {
            *counts.entry(id.kind).or_default() += 1;
        }
        counts
    }
}

/// Union-find over the pairs whose ends are both in `candidates`. Returns components of two or
/// more members.
fn communication_components(candidates: &HashSet<u32>, pairs: &[(u32, u32)]) -> Vec<Vec<u32>> {
    fn find(parent: &mut HashMap<u32, u32>, pid: u32) -> u32 {
        let mut root = pid;
        while let Some(&up) = parent.get(&root) {
            if up == root {
                break;
            }
            root = up;
        }
        let mut cursor = pid;
        while cursor != root {
            let next = parent.insert(cursor, root).unwrap_or(root);
            cursor = next;
        }
        root
    }

    let mut parent: HashMap<u32, u32> = HashMap::new();
    for &(a, b) in pairs {
        if !candidates.contains(&a) || !candidates.contains(&b) {
            continue;
        }
        parent.entry(a).or_insert(a);
        parent.entry(b).or_insert(b);
        let (ra, rb) = (find(&mut parent, a), find(&mut parent, b));
        if ra != rb {
            parent.insert(ra.max(rb), ra.min(rb));
        }
    }

    let pids: Vec<u32> = parent.keys().copied().collect();
    let mut components: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    for pid in pids {
        let root = find(&mut parent, pid);
        components.entry(root).or_default().push(pid);
    }
    components
        .into_values()
        .filter(|members| members.len() >= 2)
        .collect()
}

/// Partitions every live entity of `snapshot` into exactly one group.
///
/// Families claim first. Entities left over are bucketed by normalized base name; buckets of
/// two or more become name clusters. Whatever remains is a candidate for isolation, except that
/// frequently communicating pairs among those candidates are lifted into communication
/// clusters. The final remainder forms a single isolated group.
pub fn assign_groups(
    snapshot: &Snapshot,
    hop_limit: usize,
    frequent_pairs: &[(u32, u32)],
) -> GroupAssignment {
    let mut assignment = GroupAssignment::default();
    let mut assigned: HashSet<u32> = HashSet::new();

    let family_index = FamilyIndex::build(snapshot);
    for members in family_index.families(hop_limit) {
        assigned.extend(members.iter().copied());
        if let Some(group) = Group::new(GroupKind::Family, members) {
            assignment.insert(group);
        }
    }

    let mut live: Vec<&_> = snapshot
        .values()
        .filter(|e| e.is_live() && !assigned.contains(&e.pid))
        .collect();
    live.sort_unstable_by_key(|e| e.pid);

    let mut buckets: BTreeMap<String, Vec<u32>> = BTreeMap::new();
    for entity in live {
        buckets.entry(entity.base_name()).or_default().push(entity.pid);
    }

    let mut candidates: HashSet<u32> = HashSet::new();
    for members in buckets.into_values() {
        if members.len() >= 2 {
            if let Some(group) = Group::new(GroupKind::NameCluster, members) {
                assignment.insert(group);
            }
        } else {
            candidates.extend(members);
        }
    }

    for members in communication_components(&candidates, frequent_pairs) {
        for pid in &members {
            candidates.remove(pid);
        }
        if let Some(group) = Group::new(GroupKind::CommunicationCluster, members) {
            assignment.insert(group);
        }
    }

    if let Some(group) = Group::new(GroupKind::Isolated, candidates.into_iter().collect()) {
        assignment.insert(group);
    }

    assignment
}
