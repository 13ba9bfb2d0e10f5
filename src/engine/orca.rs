// ORCA: Optimal Reciprocal Collision Avoidance.
//
// Based on: van den Berg, Guy, Lin, Manocha, "Reciprocal n-Body Collision
// Avoidance" (2011). Half-plane construction and the LP solver follow the
// RVO2 reference implementation (Apache 2.0).
//
// Per agent per tick: gather nearby obstacle edges and agents from the k-d
// trees, turn each into one half-plane of permitted velocities (obstacle
// lines first), then solve a 2D LP for the permitted velocity closest to the
// desired one. When the lines are jointly infeasible the fallback keeps the
// obstacle lines hard and minimises the worst agent-line violation.

use glam::{Vec2, Vec3};

use super::constants::{AVOIDANCE_EPSILON, AvoidanceConfig};
use super::entity::EntityId;
use super::entity_kd_tree::EntityKdTree;
use super::math::{det, dist_sq_point_segment, safe_divide, safe_normalize};
use super::obstacle::ObstaclesContainer;
use super::obstacle_kd_tree::{ObstacleIndices, ObstaclePointKdTree};

/// Share of the avoidance a moving agent takes when its neighbour is also
/// moving and will reciprocate.
const RECIPROCAL_EFFORT: f32 = 0.5;
/// Share taken when the neighbour is idle and will not react.
const FULL_EFFORT: f32 = 1.0;

// ============================================================================
// AGENT SNAPSHOT
// ============================================================================

/// Read-only data for one entity, collected from ECS before ORCA runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgentSnapshot {
    pub location: Vec3,
    /// Committed ground velocity from the previous tick.
    pub velocity: Vec2,
    /// Velocity toward the current waypoint at desired speed.
    pub desired_velocity: Vec2,
    pub max_speed: f32,
    /// Executing a move task. Idle entities (including static ones) never
    /// get a solve of their own but still constrain their neighbours.
    pub is_moving: bool,
}

impl AgentSnapshot {
    /// An entity that only occupies space.
    pub fn stationary(location: Vec3) -> Self {
        Self {
            location,
            velocity: Vec2::ZERO,
            desired_velocity: Vec2::ZERO,
            max_speed: 0.0,
            is_moving: false,
        }
    }

    #[inline]
    pub fn position(&self) -> Vec2 {
        self.location.truncate()
    }

    /// Velocity neighbours should predict for this entity.
    #[inline]
    fn predicted_velocity(&self) -> Vec2 {
        if self.is_moving { self.velocity } else { Vec2::ZERO }
    }
}

/// Snapshots addressed by dense entity id.
#[derive(Debug, Default)]
pub struct AgentSnapshots {
    slots: Vec<Option<AgentSnapshot>>,
}

impl AgentSnapshots {
    pub fn clear(&mut self) {
        self.slots.clear();
    }

    pub fn insert(&mut self, id: EntityId, snapshot: AgentSnapshot) {
        if !id.is_valid() {
            log::error!(target: "avoidance", "AgentSnapshots::insert: invalid entity id {}", id.0);
            return;
        }
        if self.slots.len() <= id.index() {
            self.slots.resize(id.index() + 1, None);
        }
        self.slots[id.index()] = Some(snapshot);
    }

    pub fn get(&self, id: EntityId) -> Option<&AgentSnapshot> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    /// Moving agents in ascending id order.
    pub fn moving(&self) -> impl Iterator<Item = (EntityId, &AgentSnapshot)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.as_ref()
                .filter(|snapshot| snapshot.is_moving)
                .map(|snapshot| (EntityId(index as u16), snapshot))
        })
    }
}

// ============================================================================
// ORCA HALFPLANE
// ============================================================================

/// A directed halfplane constraint in velocity space.
///
/// Convention (matches RVO2):
///   feasible region = { v : det(direction, point - v) ≤ 0 }
///   i.e. v must lie on the LEFT of the ray from `point` along `direction`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrcaLine {
    pub point: Vec2,
    pub direction: Vec2,
}

impl OrcaLine {
    /// How far `velocity` lies on the forbidden side; positive means
    /// violated.
    #[inline]
    pub fn violation(&self, velocity: Vec2) -> f32 {
        det(self.direction, self.point - velocity)
    }
}

/// Direction of the left tangent leg from the origin to a circle of radius
/// `radius` centred at `offset` (`leg` = tangent length).
#[inline]
fn left_leg(offset: Vec2, leg: f32, radius: f32) -> Vec2 {
    safe_divide(
        Vec2::new(offset.x * leg - offset.y * radius, offset.x * radius + offset.y * leg),
        offset.length_squared(),
    )
}

#[inline]
fn right_leg(offset: Vec2, leg: f32, radius: f32) -> Vec2 {
    safe_divide(
        Vec2::new(offset.x * leg + offset.y * radius, -offset.x * radius + offset.y * leg),
        offset.length_squared(),
    )
}

/// Half-plane agent A must respect to avoid neighbour B.
///
/// `relative_position` is B minus A.
/// `effort` is the fraction of the required velocity change A takes.
/// `inverse_delta_time` is only used when the two already overlap.
pub fn agent_orca_line(
    relative_position: Vec2,
    own_velocity: Vec2,
    neighbour_velocity: Vec2,
    combined_radius: f32,
    time_horizon: f32,
    inverse_delta_time: f32,
    effort: f32,
) -> OrcaLine {
    let relative_velocity = own_velocity - neighbour_velocity;
    let distance_squared = relative_position.length_squared();
    let combined_radius_squared = combined_radius * combined_radius;

    let u: Vec2;
    let direction: Vec2;

    if distance_squared > combined_radius_squared {
        // ── Not overlapping ─────────────────────────────────────────────────
        // w: relative velocity measured from the cut-off circle centre.
        let w = relative_velocity - safe_divide(relative_position, time_horizon);
        let w_length_squared = w.length_squared();
        let dot = w.dot(relative_position);

        if dot < 0.0 && dot * dot > combined_radius_squared * w_length_squared {
            // Closest boundary point is on the cut-off circle.
            let w_length = w_length_squared.sqrt();
            let unit_w = if w_length > AVOIDANCE_EPSILON { w / w_length } else { Vec2::X };
            direction = Vec2::new(unit_w.y, -unit_w.x);
            u = (safe_divide(combined_radius, time_horizon) - w_length) * unit_w;
        } else {
            // Closest boundary point is on one of the cone legs.
            let leg = (distance_squared - combined_radius_squared).max(0.0).sqrt();
            direction = if det(relative_position, w) > 0.0 {
                left_leg(relative_position, leg, combined_radius)
            } else {
                -right_leg(relative_position, leg, combined_radius)
            };
            u = relative_velocity.dot(direction) * direction - relative_velocity;
        }
    } else {
        // ── Already overlapping: resolve within one tick ───────────────────
        let w = relative_velocity - relative_position * inverse_delta_time;
        let w_length = w.length();
        let unit_w = if w_length > AVOIDANCE_EPSILON {
            w / w_length
        } else if distance_squared > AVOIDANCE_EPSILON * AVOIDANCE_EPSILON {
            // Push directly away from the neighbour's centre.
            -relative_position / distance_squared.sqrt()
        } else {
            Vec2::X
        };
        direction = Vec2::new(unit_w.y, -unit_w.x);
        u = (combined_radius * inverse_delta_time - w_length) * unit_w;
    }

    OrcaLine {
        point: own_velocity + effort * u,
        direction,
    }
}

/// Appends one half-plane per obstacle edge (at most) to `lines`.
///
/// `obstacle_neighbours` must be sorted nearest edge first: an edge whose
/// velocity obstacle is already covered by an earlier line is skipped.
/// Obstacles are static, so the agent takes the full avoidance effort.
pub fn push_obstacle_orca_lines(
    lines: &mut Vec<OrcaLine>,
    position: Vec2,
    velocity: Vec2,
    radius: f32,
    obstacle_time_horizon: f32,
    obstacles: &ObstaclesContainer,
    obstacle_neighbours: &[ObstacleIndices],
) {
    let inverse_time_horizon = safe_divide(1.0, obstacle_time_horizon);
    let radius_squared = radius * radius;

    for indices in obstacle_neighbours {
        let Some(polygon) = obstacles.polygon(indices.polygon) else {
            log::error!(target: "avoidance", "obstacle polygon {} no longer exists", indices.polygon);
            continue;
        };

        let mut left_index = indices.point;
        let mut right_index = polygon.next_index(indices.point);
        let (Some(left_start), Some(right_start)) = (polygon.get(left_index), polygon.get(right_index)) else {
            log::error!(target: "avoidance", "obstacle point {indices:?} no longer exists");
            continue;
        };

        let relative_position_1 = left_start.point - position;
        let relative_position_2 = right_start.point - position;

        let already_covered = lines.iter().any(|line| {
            det(inverse_time_horizon * relative_position_1 - line.point, line.direction)
                - inverse_time_horizon * radius
                >= -AVOIDANCE_EPSILON
                && det(inverse_time_horizon * relative_position_2 - line.point, line.direction)
                    - inverse_time_horizon * radius
                    >= -AVOIDANCE_EPSILON
        });
        if already_covered {
            continue;
        }

        let distance_squared_1 = relative_position_1.length_squared();
        let distance_squared_2 = relative_position_2.length_squared();
        let obstacle_vector = right_start.point - left_start.point;
        let s = safe_divide((-relative_position_1).dot(obstacle_vector), obstacle_vector.length_squared());
        let distance_squared_line = (-relative_position_1 - s * obstacle_vector).length_squared();

        // ── Already colliding ───────────────────────────────────────────────
        if s < 0.0 && distance_squared_1 <= radius_squared {
            // Left vertex. Ignored when concave.
            if left_start.is_convex {
                lines.push(OrcaLine {
                    point: Vec2::ZERO,
                    direction: safe_normalize(Vec2::new(-relative_position_1.y, relative_position_1.x)),
                });
            }
            continue;
        } else if s > 1.0 && distance_squared_2 <= radius_squared {
            // Right vertex. Ignored when concave or when the next edge will
            // produce the same line.
            if right_start.is_convex && det(relative_position_2, right_start.direction) >= 0.0 {
                lines.push(OrcaLine {
                    point: Vec2::ZERO,
                    direction: safe_normalize(Vec2::new(-relative_position_2.y, relative_position_2.x)),
                });
            }
            continue;
        } else if (0.0..1.0).contains(&s) && distance_squared_line <= radius_squared {
            // The segment itself.
            lines.push(OrcaLine {
                point: Vec2::ZERO,
                direction: -left_start.direction,
            });
            continue;
        }

        // ── Not colliding: find the legs ───────────────────────────────────
        // Seen obliquely, both legs come from a single vertex. A concave
        // vertex extends the cut-off line instead of producing a leg.
        let mut left_leg_direction;
        let mut right_leg_direction;

        if s < 0.0 && distance_squared_line <= radius_squared {
            if !left_start.is_convex {
                continue;
            }
            right_index = left_index;
            let leg = (distance_squared_1 - radius_squared).max(0.0).sqrt();
            left_leg_direction = left_leg(relative_position_1, leg, radius);
            right_leg_direction = right_leg(relative_position_1, leg, radius);
        } else if s > 1.0 && distance_squared_line <= radius_squared {
            if !right_start.is_convex {
                continue;
            }
            left_index = right_index;
            let leg = (distance_squared_2 - radius_squared).max(0.0).sqrt();
            left_leg_direction = left_leg(relative_position_2, leg, radius);
            right_leg_direction = right_leg(relative_position_2, leg, radius);
        } else {
            left_leg_direction = if left_start.is_convex {
                let leg = (distance_squared_1 - radius_squared).max(0.0).sqrt();
                left_leg(relative_position_1, leg, radius)
            } else {
                -left_start.direction
            };
            right_leg_direction = if right_start.is_convex {
                let leg = (distance_squared_2 - radius_squared).max(0.0).sqrt();
                right_leg(relative_position_2, leg, radius)
            } else {
                left_start.direction
            };
        }

        let (Some(left_point), Some(right_point), Some(left_neighbour)) = (
            polygon.get(left_index),
            polygon.get(right_index),
            polygon.previous(left_index),
        ) else {
            continue;
        };

        // A leg may not point into the neighbouring edge at a convex vertex;
        // that edge's cut-off line takes over and the leg becomes "foreign".
        let mut is_left_leg_foreign = false;
        let mut is_right_leg_foreign = false;
        if left_point.is_convex && det(left_leg_direction, -left_neighbour.direction) >= 0.0 {
            left_leg_direction = -left_neighbour.direction;
            is_left_leg_foreign = true;
        }
        if right_point.is_convex && det(right_leg_direction, right_point.direction) <= 0.0 {
            right_leg_direction = right_point.direction;
            is_right_leg_foreign = true;
        }

        let left_cutoff = inverse_time_horizon * (left_point.point - position);
        let right_cutoff = inverse_time_horizon * (right_point.point - position);
        let cutoff_vector = right_cutoff - left_cutoff;
        let single_vertex = left_index == right_index;

        let t = if single_vertex {
            0.5
        } else {
            safe_divide((velocity - left_cutoff).dot(cutoff_vector), cutoff_vector.length_squared())
        };
        let t_left = (velocity - left_cutoff).dot(left_leg_direction);
        let t_right = (velocity - right_cutoff).dot(right_leg_direction);

        // ── Project the current velocity onto the velocity obstacle ─────────
        if (t < 0.0 && t_left < 0.0) || (single_vertex && t_left < 0.0 && t_right < 0.0) {
            let unit_w = safe_normalize(velocity - left_cutoff);
            lines.push(OrcaLine {
                point: left_cutoff + radius * inverse_time_horizon * unit_w,
                direction: Vec2::new(unit_w.y, -unit_w.x),
            });
            continue;
        } else if t > 1.0 && t_right < 0.0 {
            let unit_w = safe_normalize(velocity - right_cutoff);
            lines.push(OrcaLine {
                point: right_cutoff + radius * inverse_time_horizon * unit_w,
                direction: Vec2::new(unit_w.y, -unit_w.x),
            });
            continue;
        }

        let distance_squared_cutoff = if t < 0.0 || t > 1.0 || single_vertex {
            f32::INFINITY
        } else {
            (velocity - (left_cutoff + t * cutoff_vector)).length_squared()
        };
        let distance_squared_left = if t_left < 0.0 {
            f32::INFINITY
        } else {
            (velocity - (left_cutoff + t_left * left_leg_direction)).length_squared()
        };
        let distance_squared_right = if t_right < 0.0 {
            f32::INFINITY
        } else {
            (velocity - (right_cutoff + t_right * right_leg_direction)).length_squared()
        };

        let (anchor, direction) = if distance_squared_cutoff <= distance_squared_left
            && distance_squared_cutoff <= distance_squared_right
        {
            (left_cutoff, -left_point.direction)
        } else if distance_squared_left <= distance_squared_right {
            if is_left_leg_foreign {
                continue;
            }
            (left_cutoff, left_leg_direction)
        } else {
            if is_right_leg_foreign {
                continue;
            }
            (right_cutoff, -right_leg_direction)
        };

        lines.push(OrcaLine {
            point: anchor + radius * inverse_time_horizon * Vec2::new(-direction.y, direction.x),
            direction,
        });
    }
}

// ============================================================================
// 2-D LINEAR PROGRAMME  (RVO2 linearProgram1/2/3)
// ============================================================================

/// Solve the 1-D sub-problem on line `line_no`, given that lines
/// `0..line_no` are already satisfied.
///
/// `direction_opt = true`  → go as far as possible along `opt_velocity`.
/// `direction_opt = false` → closest point to `opt_velocity`.
///
/// Returns `false` if the sub-problem is infeasible.
fn lp1(
    lines: &[OrcaLine],
    line_no: usize,
    radius: f32,
    opt_velocity: Vec2,
    direction_opt: bool,
    result: &mut Vec2,
) -> bool {
    let line = &lines[line_no];
    let dot_product = line.point.dot(line.direction);
    let discriminant = dot_product * dot_product + radius * radius - line.point.length_squared();
    if discriminant < 0.0 {
        // Speed circle fully cuts off this line.
        return false;
    }
    let sqrt_discriminant = discriminant.sqrt();
    let mut t_left = -dot_product - sqrt_discriminant;
    let mut t_right = -dot_product + sqrt_discriminant;

    for previous in &lines[..line_no] {
        let denominator = det(line.direction, previous.direction);
        let numerator = det(previous.direction, line.point - previous.point);

        if denominator.abs() <= AVOIDANCE_EPSILON {
            // Parallel lines.
            if numerator < 0.0 {
                return false;
            }
            continue;
        }

        let t = numerator / denominator;
        if denominator >= 0.0 {
            // `previous` bounds this line on the right.
            t_right = t_right.min(t);
        } else {
            // `previous` bounds this line on the left.
            t_left = t_left.max(t);
        }

        if t_left > t_right {
            return false;
        }
    }

    if direction_opt {
        if opt_velocity.dot(line.direction) > 0.0 {
            *result = line.point + t_right * line.direction;
        } else {
            *result = line.point + t_left * line.direction;
        }
    } else {
        let t = line.direction.dot(opt_velocity - line.point);
        *result = line.point + t.clamp(t_left, t_right) * line.direction;
    }
    true
}

/// Main 2-D LP over all lines in order.
///
/// Returns the index of the first line that could not be satisfied
/// (`lines.len()` on success).
fn lp2(
    lines: &[OrcaLine],
    radius: f32,
    opt_velocity: Vec2,
    direction_opt: bool,
    result: &mut Vec2,
) -> usize {
    if direction_opt {
        // `opt_velocity` is a unit direction here.
        *result = opt_velocity * radius;
    } else if opt_velocity.length_squared() > radius * radius {
        *result = safe_normalize(opt_velocity) * radius;
    } else {
        *result = opt_velocity;
    }

    for (i, line) in lines.iter().enumerate() {
        if line.violation(*result) > 0.0 {
            let previous = *result;
            if !lp1(lines, i, radius, opt_velocity, direction_opt, result) {
                *result = previous;
                return i;
            }
        }
    }
    lines.len()
}

/// Fallback when the lines are jointly infeasible: keep the first
/// `num_obstacle_lines` lines hard and minimise the maximum violation of the
/// remaining ones, starting at `begin_line`.
fn lp3(
    lines: &[OrcaLine],
    num_obstacle_lines: usize,
    begin_line: usize,
    radius: f32,
    result: &mut Vec2,
    projected: &mut Vec<OrcaLine>,
) {
    let mut distance = 0.0f32;

    for i in begin_line..lines.len() {
        let line = lines[i];
        if line.violation(*result) <= distance {
            continue;
        }

        // Project every softer earlier line onto the boundary of line i.
        projected.clear();
        projected.extend_from_slice(&lines[..num_obstacle_lines]);

        // Empty when line i is itself an obstacle line.
        for other in &lines[num_obstacle_lines.min(i)..i] {
            let determinant = det(line.direction, other.direction);
            let point = if determinant.abs() <= AVOIDANCE_EPSILON {
                if line.direction.dot(other.direction) > 0.0 {
                    // Same direction: already subsumed.
                    continue;
                }
                // Opposite direction: midpoint constraint.
                0.5 * (line.point + other.point)
            } else {
                line.point + (det(other.direction, line.point - other.point) / determinant) * line.direction
            };
            projected.push(OrcaLine {
                point,
                direction: safe_normalize(other.direction - line.direction),
            });
        }

        let previous = *result;
        let opt_direction = Vec2::new(-line.direction.y, line.direction.x);
        if lp2(projected, radius, opt_direction, true, result) < projected.len() {
            // Only possible through floating point error; keep the last
            // good answer.
            *result = previous;
        }

        distance = line.violation(*result);
    }
}

/// Closest velocity to `desired_velocity` inside the `max_speed` disc that
/// satisfies `lines`. The first `num_obstacle_lines` lines are obstacle
/// lines and stay hard when the set is infeasible.
pub fn solve_orca_lines(
    lines: &[OrcaLine],
    num_obstacle_lines: usize,
    max_speed: f32,
    desired_velocity: Vec2,
    projected: &mut Vec<OrcaLine>,
) -> Vec2 {
    if lines.is_empty() {
        return desired_velocity;
    }

    let mut result = Vec2::ZERO;
    let failed_line = lp2(lines, max_speed, desired_velocity, false, &mut result);
    if failed_line < lines.len() {
        log::trace!(
            target: "avoidance",
            "orca lines infeasible at line {failed_line} of {}, relaxing",
            lines.len()
        );
        lp3(lines, num_obstacle_lines, failed_line, max_speed, &mut result, projected);
    }
    result
}

// ============================================================================
// PUBLIC API
// ============================================================================

/// Everything an avoidance solve reads, shared by every agent in a tick.
pub struct AvoidanceContext<'a> {
    pub snapshots: &'a AgentSnapshots,
    pub entity_tree: &'a EntityKdTree,
    pub obstacle_tree: &'a ObstaclePointKdTree,
    pub obstacles: &'a ObstaclesContainer,
    pub config: &'a AvoidanceConfig,
    pub delta_time: f32,
}

/// Buffers reused across solves so the hot loop does not allocate.
#[derive(Default)]
pub struct AvoidanceScratch {
    pub neighbours: Vec<EntityId>,
    pub obstacle_neighbours: Vec<ObstacleIndices>,
    pub lines: Vec<OrcaLine>,
    projected: Vec<OrcaLine>,
    sorted_obstacles: Vec<(f32, ObstacleIndices)>,
}

/// Proposed avoidance velocity for one moving agent.
///
/// With no nearby agents or obstacle edges this is exactly the agent's
/// desired velocity. Otherwise it lies within `max_speed` and respects every
/// obstacle line; agent lines are satisfied when jointly feasible and
/// violated as little as possible when not.
pub fn compute_avoidance_velocity(
    agent_id: EntityId,
    agent: &AgentSnapshot,
    context: &AvoidanceContext<'_>,
    scratch: &mut AvoidanceScratch,
) -> Vec2 {
    let config = context.config;
    let position = agent.position();
    let inverse_delta_time = safe_divide(1.0, context.delta_time);

    scratch.lines.clear();

    // ── Obstacle lines (nearest edge first) ─────────────────────────────────
    scratch.obstacle_neighbours.clear();
    context.obstacle_tree.find_obstacles_within_range_into(
        &mut scratch.obstacle_neighbours,
        context.obstacles,
        agent.location,
        config.search_radius,
    );

    scratch.sorted_obstacles.clear();
    scratch.sorted_obstacles.extend(scratch.obstacle_neighbours.iter().filter_map(|indices| {
        let (start, end) = indices.resolve_edge(context.obstacles)?;
        Some((dist_sq_point_segment(start.point, end.point, position), *indices))
    }));
    scratch.sorted_obstacles.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    scratch.obstacle_neighbours.clear();
    scratch
        .obstacle_neighbours
        .extend(scratch.sorted_obstacles.iter().map(|(_, indices)| *indices));

    push_obstacle_orca_lines(
        &mut scratch.lines,
        position,
        agent.velocity,
        config.agent_radius,
        config.obstacle_prediction_time,
        context.obstacles,
        &scratch.obstacle_neighbours,
    );
    let num_obstacle_lines = scratch.lines.len();

    // ── Agent lines ─────────────────────────────────────────────────────────
    scratch.neighbours.clear();
    context.entity_tree.find_entities_within_range_into(
        &mut scratch.neighbours,
        agent.location,
        config.search_radius,
        agent_id,
    );

    for &neighbour_id in &scratch.neighbours {
        let Some(neighbour) = context.snapshots.get(neighbour_id) else {
            log::error!(target: "avoidance", "neighbour {neighbour_id} of {agent_id} has no snapshot");
            continue;
        };

        let effort = if neighbour.is_moving { RECIPROCAL_EFFORT } else { FULL_EFFORT };
        scratch.lines.push(agent_orca_line(
            neighbour.position() - position,
            agent.velocity,
            neighbour.predicted_velocity(),
            config.combined_radius(),
            config.collision_prediction_time,
            inverse_delta_time,
            effort,
        ));
    }

    solve_orca_lines(
        &scratch.lines,
        num_obstacle_lines,
        agent.max_speed,
        agent.desired_velocity,
        &mut scratch.projected,
    )
}
