use crate::extracts::process::types::Snapshot;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// Undirected parent/child adjacency between live entities.
#[derive(Debug, Default, Clone)]
pub struct FamilyIndex {
    neighbors: HashMap<u32, BTreeSet<u32>>,
}

impl FamilyIndex {
    /// Adds an edge for every live entity whose parent is also live.
    pub fn build(snapshot: &Snapshot) -> Self {
        let mut index = Self::default();
        for entity in snapshot.values().filter(|e| e.is_live()) {
            if entity.ppid == entity.pid {
                continue;
            }
            let parent_live = snapshot
                .get(&entity.ppid)
                .is_some_and(|parent| parent.is_live());
            if parent_live {
                index.neighbors.entry(entity.ppid).or_default().insert(entity.pid);
                index.neighbors.entry(entity.pid).or_default().insert(entity.ppid);
            }
        }
        index
    }

    /// Ids reachable from `root` within `hop_limit` edges, skipping anything in `excluded`.
    /// Includes `root` itself. Sorted ascending.
    pub fn related(&self, root: u32, hop_limit: usize, excluded: &HashSet<u32>) -> Vec<u32> {
        let mut visited: HashSet<u32> = HashSet::from([root]);
        let mut queue = VecDeque::from([(root, 0usize)]);

        while let Some((pid, depth)) = queue.pop_front() {
            if depth >= hop_limit {
                continue;
            }
            let Some(next) = self.neighbors.get(&pid) else {
                continue;
            };
            for &neighbor in next {
                if excluded.contains(&neighbor) || !visited.insert(neighbor) {
                    continue;
                }
                queue.push_back((neighbor, depth + 1));
            }
        }

        let mut related: Vec<u32> = visited.into_iter().collect();
        related.sort_unstable();
        related
    }

    /// Partitions the ids that have at least one live relative into families. Seeds are taken
    /// in ascending order, and a family claims its members before later seeds are considered.
    pub fn families(&self, hop_limit: usize) -> Vec<Vec<u32>> {
        let mut seeds: Vec<u32> = self
            .neighbors
            .iter()
            .filter(|(_, n)| !n.is_empty())
            .map(|(&pid, _)| pid)
            .collect();
        seeds.sort_unstable();

        let mut assigned = HashSet::new();
        let mut families = Vec::new();
        for seed in seeds {
            if assigned.contains(&seed) {
                continue;
            }
            let members = self.related(seed, hop_limit, &assigned);
            if members.len() < 2 {
                continue;
            }
            assigned.extend(members.iter().copied());
            families.push(members);
        }
        families
    }
}
