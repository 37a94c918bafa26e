use crate::simulation::vector::Vec2;
use std::collections::HashMap;

/// Uniform bucket grid over entity positions, rebuilt every tick and read-only afterwards.
#[derive(Debug, Clone)]
pub struct SpatialGrid {
    cell_size: f64,
    cells: HashMap<(i64, i64), Vec<(u32, Vec2)>>,
}

impl SpatialGrid {
    pub fn new(cell_size: f64) -> Self {
        Self {
            cell_size: cell_size.max(1.0),
            cells: HashMap::new(),
        }
    }

    fn cell_of(&self, position: Vec2) -> (i64, i64) {
        (
            (position.x / self.cell_size).floor() as i64,
            (position.y / self.cell_size).floor() as i64,
        )
    }

    pub fn rebuild(&mut self, entries: impl IntoIterator<Item = (u32, Vec2)>) {
        self.cells.clear();
        for (pid, position) in entries {
            let cell = self.cell_of(position);
            self.cells.entry(cell).or_default().push((pid, position));
        }
    }

    pub fn len(&self) -> usize {
        self.cells.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Ids in the 3x3 block of cells around `position`, other than `exclude`, closest first and
    /// at most `cap` of them.
    pub fn neighbors(&self, position: Vec2, exclude: u32, cap: usize) -> Vec<u32> {
        let (cx, cy) = self.cell_of(position);
        let mut found: Vec<(f64, u32)> = Vec::new();
        for dx in -1..=1 {
            for dy in -1..=1 {
                let Some(bucket) = self.cells.get(&(cx + dx, cy + dy)) else {
                    continue;
                };
                found.extend(
                    bucket
                        .iter()
                        .filter(|(pid, _)| *pid != exclude)
                        .map(|(pid, other)| (position.distance(*other), *pid)),
                );
            }
        }
        found.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        found.truncate(cap);
        found.into_iter().map(|(_, pid)| pid).collect()
    }
}
