// Headless avoidance demo: two groups cross paths next to a wall block.

use std::time::{Duration, Instant};

use clap::Parser;
use glam::{Vec2, Vec3};
use rand::Rng;

use rts_avoidance::engine::{EntityId, ObstaclePolygon, Simulation, UnitAgent};
use rts_avoidance::logging;

const TICK_SECONDS: f32 = 1.0 / 30.0;
const GROUP_OFFSET: f32 = 1500.0;
const AGENT_SPACING: f32 = 120.0;

/// Two groups of agents crossing paths beside a wall block
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log per-tick debug output
    #[arg(short, long)]
    verbose: bool,

    /// Agents in each of the two groups
    #[arg(short, long, default_value_t = 64)]
    agents: usize,

    /// Upper bound on ticks to run
    #[arg(short, long, default_value_t = 900)]
    ticks: usize,
}

// ============================================================================
// SCENE
// ============================================================================

/// Spawns a square block of agents centred on `centre`, each ordered to the
/// mirrored slot around `destination`.
fn spawn_group(simulation: &mut Simulation, count: usize, centre: Vec3, destination: Vec3) -> Vec<EntityId> {
    let mut rng = rand::thread_rng();
    let side = (count as f32).sqrt().ceil() as usize;
    let half_extent = (side as f32 - 1.0) * AGENT_SPACING * 0.5;

    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
        let slot = Vec3::new(
            (i % side) as f32 * AGENT_SPACING - half_extent,
            (i / side) as f32 * AGENT_SPACING - half_extent,
            0.0,
        );
        let jitter = Vec3::new(rng.gen_range(-10.0..10.0), rng.gen_range(-10.0..10.0), 0.0);

        let agent = UnitAgent {
            desired_speed: rng.gen_range(280.0..320.0),
            max_speed: 400.0,
        };
        let Some(id) = simulation.spawn_agent(centre + slot + jitter, agent) else {
            log::error!(target: "sim", "ran out of entity ids after {} agents", ids.len());
            break;
        };
        simulation.issue_move(id, vec![destination + slot]);
        ids.push(id);
    }
    ids
}

fn wall_block() -> ObstaclePolygon {
    // Counter-clockwise, sitting just above the crossing lane.
    ObstaclePolygon::from_points(&[
        Vec2::new(-150.0, 700.0),
        Vec2::new(150.0, 700.0),
        Vec2::new(150.0, 900.0),
        Vec2::new(-150.0, 900.0),
    ])
}

fn closest_pair_distance(simulation: &Simulation, ids: &[EntityId]) -> f32 {
    let locations: Vec<Vec2> = ids
        .iter()
        .filter_map(|id| simulation.location(*id))
        .map(|location| location.truncate())
        .collect();

    let mut closest = f32::INFINITY;
    for (i, a) in locations.iter().enumerate() {
        for b in &locations[i + 1..] {
            closest = closest.min(a.distance(*b));
        }
    }
    closest
}

// ============================================================================
// MAIN
// ============================================================================

fn main() {
    let args = Args::parse();
    logging::init(args.verbose);

    let mut simulation = Simulation::default();
    simulation.set_obstacles(vec![wall_block()]);

    let west = Vec3::new(-GROUP_OFFSET, 0.0, 0.0);
    let east = Vec3::new(GROUP_OFFSET, 0.0, 0.0);
    let mut agents = spawn_group(&mut simulation, args.agents, west, east);
    agents.extend(spawn_group(&mut simulation, args.agents, east, west));
    log::info!(target: "sim", "spawned {} agents", agents.len());

    let mut window_time = Duration::ZERO;
    let mut total_time = Duration::ZERO;
    let mut closest_ever = f32::INFINITY;

    for tick in 1..=args.ticks {
        let started = Instant::now();
        simulation.tick(TICK_SECONDS);
        let elapsed = started.elapsed();
        window_time += elapsed;
        total_time += elapsed;

        closest_ever = closest_ever.min(closest_pair_distance(&simulation, &agents));

        if tick % 60 == 0 {
            let moving = agents.iter().filter(|id| simulation.is_moving(**id)).count();
            log::info!(
                target: "sim",
                "tick {tick}: {moving}/{} moving | avg tick {:?}",
                agents.len(),
                window_time / 60
            );
            window_time = Duration::ZERO;
        }

        if agents.iter().all(|id| !simulation.is_moving(*id)) {
            log::info!(target: "sim", "all agents arrived after {tick} ticks");
            break;
        }
    }

    let ticks_run = simulation.clock().tick.max(1) as u32;
    log::info!(
        target: "sim",
        "avg tick {:?} | closest approach {:.1} (agent diameter {:.1})",
        total_time / ticks_run,
        closest_ever,
        simulation.config().combined_radius()
    );

    for id in agents.iter().take(4) {
        if let Some(location) = simulation.location(*id) {
            log::info!(target: "sim", "agent {id} finished at ({:.1}, {:.1})", location.x, location.y);
        }
    }

    simulation.shutdown();
}
