use crate::simulation::vector::Vec2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlockParams {
    pub separation_radius: f64,
    pub alignment_radius: f64,
    pub cohesion_radius: f64,
    pub separation_weight: f64,
    pub alignment_weight: f64,
    pub cohesion_weight: f64,
    pub max_force: f64,
    pub avoidance_radius: f64,
    pub avoidance_gain: f64,
    pub max_avoidance: f64,
    /// Constant pull between two entities with a known connection
    pub link_attraction: f64,
}

impl Default for FlockParams {
    fn default() -> Self {
        Self {
            separation_radius: 30.0,
            alignment_radius: 50.0,
            cohesion_radius: 70.0,
            separation_weight: 0.05,
            alignment_weight: 0.03,
            cohesion_weight: 0.02,
            max_force: 0.5,
            avoidance_radius: 80.0,
            avoidance_gain: 2.0,
            max_avoidance: 1.0,
            link_attraction: 0.02,
        }
    }
}

/// What one entity knows about a nearby one during force computation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub position: Vec2,
    pub velocity: Vec2,
    pub energy: f64,
    pub same_group: bool,
}

/// Separation, alignment and cohesion against same-group neighbors, weighted and clamped.
pub fn flocking_force(
    position: Vec2,
    velocity: Vec2,
    neighbors: &[Neighbor],
    params: &FlockParams,
) -> Vec2 {
    let mut separation = Vec2::ZERO;
    let mut separation_count = 0usize;
    let mut heading = Vec2::ZERO;
    let mut heading_count = 0usize;
    let mut centroid = Vec2::ZERO;
    let mut centroid_count = 0usize;

    for other in neighbors.iter().filter(|n| n.same_group) {
        let offset = position - other.position;
        let distance = offset.length();

        if distance > 0.0 && distance < params.separation_radius {
            separation += offset / distance;
            separation_count += 1;
        }
        if distance < params.alignment_radius {
            heading += other.velocity;
            heading_count += 1;
        }
        if distance < params.cohesion_radius {
            centroid += other.position;
            centroid_count += 1;
        }
    }

    let mut force = Vec2::ZERO;
    if separation_count > 0 {
        force += separation / separation_count as f64 * params.separation_weight;
    }
    if heading_count > 0 {
        force += (heading / heading_count as f64 - velocity) * params.alignment_weight;
    }
    if centroid_count > 0 {
        force += (centroid / centroid_count as f64 - position) * params.cohesion_weight;
    }
    force.clamp_length(params.max_force)
}

/// Steers away from every nearby neighbor carrying strictly more energy. Strength grows with
/// the energy ratio and falls off with distance.
pub fn avoidance_force(
    position: Vec2,
    energy: f64,
    neighbors: &[Neighbor],
    params: &FlockParams,
) -> Vec2 {
    if energy <= 0.0 {
        return Vec2::ZERO;
    }
    let mut force = Vec2::ZERO;
    for other in neighbors {
        if other.energy <= energy {
            continue;
        }
        let offset = position - other.position;
        let distance = offset.length();
        if distance <= f64::EPSILON || distance >= params.avoidance_radius {
            continue;
        }
        let ratio = other.energy / energy;
        force += offset.normalized() * (params.avoidance_gain * ratio / distance);
    }
    force.clamp_length(params.max_avoidance)
}

/// Fixed-strength pull from `position` toward a connected partner. Vanishes once the two are
/// within one unit of each other.
pub fn attraction_force(position: Vec2, partner: Vec2, params: &FlockParams) -> Vec2 {
    let offset = partner - position;
    let distance = offset.length();
    if distance <= 1.0 {
        return Vec2::ZERO;
    }
    offset / distance * params.link_attraction
}

#[cfg(test)]
mod tests {
    use super::*;

    fn neighbor(x: f64, y: f64, energy: f64, same_group: bool) -> Neighbor {
        Neighbor {
            position: Vec2::new(x, y),
            velocity: Vec2::new(1.0, 0.0),
            energy,
            same_group,
        }
    }

    #[test]
    fn test_no_neighbors_no_force() {
        let params = FlockParams::default();
        assert_eq!(flocking_force(Vec2::ZERO, Vec2::ZERO, &[], &params), Vec2::ZERO);
        assert_eq!(avoidance_force(Vec2::ZERO, 1.0, &[], &params), Vec2::ZERO);
    }

    #[test]
    fn test_flocking_ignores_other_groups() {
        let params = FlockParams::default();
        let others = [neighbor(10.0, 0.0, 1.0, false)];
        assert_eq!(
            flocking_force(Vec2::ZERO, Vec2::ZERO, &others, &params),
            Vec2::ZERO
        );
    }

    #[test]
    fn test_close_groupmate_pushes_away_and_force_is_clamped() {
        let params = FlockParams::default();
        let close = [neighbor(5.0, 0.0, 1.0, true)];
        let force = flocking_force(Vec2::ZERO, Vec2::ZERO, &close, &params);
        assert!(force.length() <= params.max_force + 1e-12);

        let far = [neighbor(65.0, 0.0, 1.0, true)];
        let pull = flocking_force(Vec2::ZERO, Vec2::ZERO, &far, &params);
        assert!(pull.x > 0.0, "cohesion pulls toward a distant groupmate");
    }

    #[test]
    fn test_small_fish_flees_large_fish() {
        let params = FlockParams::default();
        let big = [neighbor(20.0, 0.0, 100.0, false)];
        let flee = avoidance_force(Vec2::ZERO, 2.0, &big, &params);
        assert!(flee.x < 0.0);

        let small = [neighbor(20.0, 0.0, 1.0, false)];
        assert_eq!(avoidance_force(Vec2::ZERO, 2.0, &small, &params), Vec2::ZERO);
    }

    #[test]
    fn test_avoidance_scales_with_ratio_and_distance() {
        let params = FlockParams {
            max_avoidance: f64::MAX,
            ..FlockParams::default()
        };
        let near = avoidance_force(Vec2::ZERO, 1.0, &[neighbor(10.0, 0.0, 4.0, false)], &params);
        let far = avoidance_force(Vec2::ZERO, 1.0, &[neighbor(40.0, 0.0, 4.0, false)], &params);
        let heavier =
            avoidance_force(Vec2::ZERO, 1.0, &[neighbor(10.0, 0.0, 8.0, false)], &params);
        assert!(near.length() > far.length());
        assert!(heavier.length() > near.length());
    }

    #[test]
    fn test_attraction_points_at_partner_with_fixed_strength() {
        let params = FlockParams::default();
        let pull = attraction_force(Vec2::ZERO, Vec2::new(0.0, 300.0), &params);
        assert!(pull.x.abs() < 1e-12);
        assert!((pull.y - params.link_attraction).abs() < 1e-12);

        let near = attraction_force(Vec2::ZERO, Vec2::new(0.5, 0.0), &params);
        assert_eq!(near, Vec2::ZERO);
    }
}
