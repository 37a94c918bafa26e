use crate::constants::ACTIVE_TICK_HZ;
use crate::extracts::process::types::{Connection, LifecycleEvent, LifecycleEventKind, Snapshot};
use crate::relationships::{GroupAssignment, GroupId};
use crate::simulation::entity::{speed_limit, MotionState, SimEntity};
use crate::simulation::forces::{
    attraction_force, avoidance_force, flocking_force, FlockParams, Neighbor,
};
use crate::simulation::spatial_grid::SpatialGrid;
use crate::simulation::vector::Vec2;
use rand::{Rng, RngCore};
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

pub const GRID_CELL_SIZE: f64 = 120.0;
pub const MAX_NEIGHBORS: usize = 16;

const MAX_MOTION_STEPS: f64 = 4.0;

const EDGE_MARGIN: f64 = 20.0;
const EDGE_DAMPING: f64 = 0.8;
const SPAWN_MARGIN: f64 = 50.0;
const SPAWN_SCATTER: f64 = 50.0;
const FOLLOWER_SPREAD: f64 = 60.0;
const RETARGET_MIN_TICKS: f64 = 60.0;
const RETARGET_MAX_TICKS: f64 = 240.0;
const SEEK_GAIN: f64 = 0.001;
const SEEK_DEADBAND: f64 = 5.0;
const FRICTION: f64 = 0.98;
const SINK_PER_TICK: f64 = 0.5;

/// Knobs the quality controller turns on the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulationSettings {
    /// When off, no grid is built and flocking and avoidance are skipped entirely.
    pub neighbor_search: bool,
    /// Forces are recomputed for one entity in every `update_stride` per tick; the others keep
    /// their last steering force.
    pub update_stride: u32,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            neighbor_search: true,
            update_stride: 1,
        }
    }
}

/// Per-group data derived once per step.
struct Flock {
    /// Highest-CPU member; picks the target the rest follow
    target_leader: u32,
    speed_cap: f64,
}

fn uniform<R: Rng + ?Sized>(rng: &mut R, lo: f64, hi: f64) -> f64 {
    if hi <= lo {
        lo
    } else {
        rng.random_range(lo..hi)
    }
}

fn flock_of<'a>(
    pid: u32,
    assignment: &GroupAssignment,
    flocks: &'a HashMap<GroupId, Flock>,
) -> Option<(GroupId, &'a Flock)> {
    let id = assignment.membership.get(&pid)?;
    flocks.get(id).map(|flock| (*id, flock))
}

pub struct Simulator {
    width: f64,
    height: f64,
    params: FlockParams,
    settings: SimulationSettings,
    grid: SpatialGrid,
    entities: BTreeMap<u32, SimEntity>,
    /// Last computed neighbor steering per entity
    steering: HashMap<u32, Vec2>,
    /// Connected pairs that pull toward each other
    links: Vec<(u32, u32)>,
    /// Ticks per second the motion constants are tuned for
    tick_hz: f64,
    rng: Box<dyn RngCore + Send>,
    frame: u64,
}

impl Simulator {
    pub fn new(width: f64, height: f64, rng: Box<dyn RngCore + Send>) -> Self {
        Self {
            width,
            height,
            params: FlockParams::default(),
            settings: SimulationSettings::default(),
            grid: SpatialGrid::new(GRID_CELL_SIZE),
            entities: BTreeMap::new(),
            steering: HashMap::new(),
            links: Vec::new(),
            tick_hz: f64::from(ACTIVE_TICK_HZ),
            rng,
            frame: 0,
        }
    }

    /// Sets the tick rate at which one `step` advances motion by exactly one increment.
    pub fn with_tick_rate(mut self, hz: u32) -> Self {
        self.tick_hz = f64::from(hz.max(1));
        self
    }

    pub fn tick_rate(&self) -> f64 {
        self.tick_hz
    }

    /// Replaces the set of connected pairs that attract each other.
    pub fn set_links(&mut self, connections: &[Connection]) {
        self.links = connections.iter().map(Connection::pair).collect();
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.entities.contains_key(&pid)
    }

    pub fn entity(&self, pid: u32) -> Option<&SimEntity> {
        self.entities.get(&pid)
    }

    pub fn settings(&self) -> SimulationSettings {
        self.settings
    }

    pub fn set_settings(&mut self, settings: SimulationSettings) {
        self.settings = SimulationSettings {
            update_stride: settings.update_stride.max(1),
            ..settings
        };
    }

    pub fn world(&self) -> (f64, f64) {
        (self.width, self.height)
    }

    fn random_point(&mut self) -> Vec2 {
        let rng = self.rng.as_mut();
        Vec2::new(
            uniform(rng, SPAWN_MARGIN, self.width - SPAWN_MARGIN),
            uniform(rng, SPAWN_MARGIN, self.height - SPAWN_MARGIN),
        )
    }

    fn clamp_to_world(&self, point: Vec2) -> Vec2 {
        Vec2::new(
            point.x.clamp(EDGE_MARGIN, (self.width - EDGE_MARGIN).max(EDGE_MARGIN)),
            point.y.clamp(EDGE_MARGIN, (self.height - EDGE_MARGIN).max(EDGE_MARGIN)),
        )
    }

    fn spawn_entity(&mut self, pid: u32, parent: Option<Vec2>) -> SimEntity {
        let position = match parent {
            Some(origin) => {
                let rng = self.rng.as_mut();
                let scatter = Vec2::new(
                    uniform(rng, -SPAWN_SCATTER, SPAWN_SCATTER),
                    uniform(rng, -SPAWN_SCATTER, SPAWN_SCATTER),
                );
                self.clamp_to_world(origin + scatter)
            }
            None => self.random_point(),
        };
        let rng = self.rng.as_mut();
        let velocity = Vec2::new(uniform(rng, -1.0, 1.0), uniform(rng, -1.0, 1.0));
        let retarget_in = uniform(rng, 0.0, RETARGET_MAX_TICKS);
        SimEntity::new(pid, position, velocity, retarget_in)
    }

    /// Applies lifecycle effects: forks light up the parent, execs start a transition, exits
    /// start the decay.
    pub fn apply_events(&mut self, events: &[LifecycleEvent]) {
        for event in events {
            match event.kind {
                LifecycleEventKind::Spawn => {
                    if let Some(parent) = event.ppid.and_then(|ppid| self.entities.get_mut(&ppid)) {
                        parent.mark_forked();
                    }
                }
                LifecycleEventKind::Exec => {
                    if let Some(entity) = self.entities.get_mut(&event.pid) {
                        entity.mark_exec();
                    }
                }
                LifecycleEventKind::Exit => {
                    if let Some(entity) = self.entities.get_mut(&event.pid) {
                        entity.start_dying();
                    }
                }
            }
        }
    }

    /// Brings the entity set in line with `snapshot`. New live records spawn near their parent
    /// when it is simulated; dying records and anything no longer present start to decay.
    pub fn sync(&mut self, snapshot: &Snapshot) {
        let mut pids: Vec<u32> = snapshot.keys().copied().collect();
        pids.sort_unstable();

        for pid in pids {
            let Some(record) = snapshot.get(&pid) else {
                continue;
            };
            if !self.entities.contains_key(&pid) {
                if !record.is_live() {
                    continue;
                }
                let parent = self
                    .entities
                    .get(&record.ppid)
                    .filter(|_| record.ppid != pid)
                    .map(|p| p.position);
                let entity = self.spawn_entity(pid, parent);
                self.entities.insert(pid, entity);
            }
            if let Some(entity) = self.entities.get_mut(&pid) {
                entity.update_vitals(record.memory_percent, record.cpu_percent);
                if record.is_dying {
                    entity.start_dying();
                }
            }
        }

        for (pid, entity) in self.entities.iter_mut() {
            if !snapshot.contains_key(pid) {
                entity.start_dying();
            }
        }
    }

    fn flocks(&self, assignment: &GroupAssignment) -> HashMap<GroupId, Flock> {
        let mut flocks = HashMap::new();
        for group in assignment.groups.values().filter(|g| g.flocks()) {
            let members: Vec<&SimEntity> = group
                .members
                .iter()
                .filter_map(|pid| self.entities.get(pid))
                .collect();
            if members.len() < 2 {
                continue;
            }
            let Some(target_leader) = members
                .iter()
                .max_by(|a, b| a.cpu_percent.total_cmp(&b.cpu_percent).then(b.pid.cmp(&a.pid)))
                .map(|e| e.pid)
            else {
                continue;
            };
            let avg_cpu =
                members.iter().map(|e| e.cpu_percent as f64).sum::<f64>() / members.len() as f64;
            flocks.insert(
                group.id,
                Flock {
                    target_leader,
                    speed_cap: speed_limit(avg_cpu as f32),
                },
            );
        }
        flocks
    }

    fn link_attraction(&self) -> HashMap<u32, Vec2> {
        let mut pulls: HashMap<u32, Vec2> = HashMap::new();
        for &(a, b) in &self.links {
            let (Some(first), Some(second)) = (self.entities.get(&a), self.entities.get(&b)) else {
                continue;
            };
            *pulls.entry(a).or_default() +=
                attraction_force(first.position, second.position, &self.params);
            *pulls.entry(b).or_default() +=
                attraction_force(second.position, first.position, &self.params);
        }
        pulls
    }

    fn retarget(&mut self, steps: f64, assignment: &GroupAssignment, flocks: &HashMap<GroupId, Flock>) {
        let pids: Vec<u32> = self.entities.keys().copied().collect();
        let mut due: Vec<u32> = Vec::new();
        for pid in &pids {
            if let Some(entity) = self.entities.get_mut(pid) {
                entity.retarget_in -= steps;
                if entity.retarget_in <= 0.0 {
                    due.push(*pid);
                }
            }
        }

        // leaders and loners pick first so followers can offset from a fresh leader target
        let (followers, independents): (Vec<u32>, Vec<u32>) = due.into_iter().partition(|pid| {
            flock_of(*pid, assignment, flocks)
                .is_some_and(|(_, flock)| flock.target_leader != *pid)
        });

        for pid in independents {
            let target = self.random_point();
            self.set_target(pid, target);
        }
        for pid in followers {
            let leader_target = flock_of(pid, assignment, flocks)
                .and_then(|(_, flock)| self.entities.get(&flock.target_leader))
                .map(|leader| leader.target);
            let target = match leader_target {
                Some(anchor) => {
                    let rng = self.rng.as_mut();
                    let offset = Vec2::new(
                        uniform(rng, -FOLLOWER_SPREAD, FOLLOWER_SPREAD),
                        uniform(rng, -FOLLOWER_SPREAD, FOLLOWER_SPREAD),
                    );
                    self.clamp_to_world(anchor + offset)
                }
                None => self.random_point(),
            };
            self.set_target(pid, target);
        }
    }

    fn set_target(&mut self, pid: u32, target: Vec2) {
        let retarget_in = uniform(self.rng.as_mut(), RETARGET_MIN_TICKS, RETARGET_MAX_TICKS);
        if let Some(entity) = self.entities.get_mut(&pid) {
            entity.target = target;
            entity.retarget_in = retarget_in;
        }
    }

    /// Advances the simulation by `dt` seconds.
    pub fn step(&mut self, dt: f64, assignment: &GroupAssignment) {
        let steps = if dt.is_finite() { (dt * self.tick_hz).max(0.0) } else { 0.0 };
        let motion = steps.min(MAX_MOTION_STEPS);

        let mut removed = Vec::new();
        for (pid, entity) in self.entities.iter_mut() {
            if entity.advance_phase(steps) {
                removed.push(*pid);
            }
        }
        for pid in &removed {
            self.entities.remove(pid);
            self.steering.remove(pid);
        }
        if !removed.is_empty() {
            trace!("removed {} decayed entities", removed.len());
        }

        let flocks = self.flocks(assignment);
        self.retarget(steps, assignment, &flocks);

        let search = self.settings.neighbor_search;
        if search {
            self.grid
                .rebuild(self.entities.values().map(|e| (e.pid, e.position)));
        }

        let stride = self.settings.update_stride.max(1) as u64;
        let frame = self.frame;

        if search {
            for (index, entity) in self.entities.values().enumerate() {
                if (index as u64 + frame) % stride != 0 {
                    continue;
                }
                let own_flock = flock_of(entity.pid, assignment, &flocks).map(|(id, _)| id);
                let neighbors: Vec<Neighbor> = self
                    .grid
                    .neighbors(entity.position, entity.pid, MAX_NEIGHBORS)
                    .into_iter()
                    .filter_map(|pid| self.entities.get(&pid))
                    .map(|other| Neighbor {
                        position: other.position,
                        velocity: other.velocity,
                        energy: other.energy(),
                        same_group: own_flock.is_some()
                            && assignment.membership.get(&other.pid) == own_flock.as_ref(),
                    })
                    .collect();

                let mut force =
                    avoidance_force(entity.position, entity.energy(), &neighbors, &self.params);
                if own_flock.is_some() {
                    force +=
                        flocking_force(entity.position, entity.velocity, &neighbors, &self.params);
                }
                self.steering.insert(entity.pid, force);
            }
        } else {
            self.steering.clear();
        }
        let attraction = self.link_attraction();

        let caps: HashMap<u32, f64> = self
            .entities
            .values()
            .map(|e| {
                let cap = flock_of(e.pid, assignment, &flocks)
                    .map(|(_, flock)| flock.speed_cap)
                    .unwrap_or_else(|| speed_limit(e.cpu_percent));
                (e.pid, cap)
            })
            .collect();

        let (width, height) = (self.width, self.height);
        let mut bounced = Vec::new();
        for entity in self.entities.values_mut() {
            let mut velocity = entity.velocity;
            if let Some(force) = self.steering.get(&entity.pid) {
                velocity += *force * motion;
            }
            if let Some(pull) = attraction.get(&entity.pid) {
                velocity += *pull * motion;
            }

            let to_target = entity.target - entity.position;
            if to_target.length() > SEEK_DEADBAND {
                velocity += to_target * (SEEK_GAIN * motion);
            }
            if entity.is_dying() {
                velocity.y += SINK_PER_TICK * motion;
            }

            velocity = velocity * FRICTION.powf(motion);
            let cap = caps.get(&entity.pid).copied().unwrap_or(2.0);
            velocity = velocity.clamp_length(cap);
            if !velocity.is_finite() {
                velocity = Vec2::ZERO;
            }

            let mut position = entity.position + velocity * motion;
            let mut hit_edge = false;
            let (max_x, max_y) = ((width - EDGE_MARGIN).max(EDGE_MARGIN), (height - EDGE_MARGIN).max(EDGE_MARGIN));
            if position.x < EDGE_MARGIN {
                position.x = EDGE_MARGIN;
                velocity.x = velocity.x.abs() * EDGE_DAMPING;
                hit_edge = true;
            } else if position.x > max_x {
                position.x = max_x;
                velocity.x = -velocity.x.abs() * EDGE_DAMPING;
                hit_edge = true;
            }
            if position.y < EDGE_MARGIN {
                position.y = EDGE_MARGIN;
                velocity.y = velocity.y.abs() * EDGE_DAMPING;
                hit_edge = true;
            } else if position.y > max_y {
                position.y = max_y;
                velocity.y = -velocity.y.abs() * EDGE_DAMPING;
                hit_edge = true;
            }

            entity.position = position;
            entity.velocity = velocity;
            if hit_edge && !entity.is_dying() {
                bounced.push(entity.pid);
            }
        }

        for pid in bounced {
            let target = self.random_point();
            self.set_target(pid, target);
        }

        self.frame = self.frame.wrapping_add(1);
    }

    pub fn motion_states(&self, assignment: &GroupAssignment) -> BTreeMap<u32, MotionState> {
        self.entities
            .iter()
            .map(|(pid, entity)| {
                (*pid, entity.motion_state(assignment.membership.get(pid).copied()))
            })
            .collect()
    }
}
