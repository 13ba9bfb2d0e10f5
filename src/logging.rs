use env_logger::{Builder, Env};
use log::LevelFilter;

/// Targets the engine logs under, one per subsystem.
pub const TARGETS: [&str; 4] = ["spatial", "avoidance", "ecs", "sim"];

/// Default filter when `RUST_LOG` is unset. Verbose runs turn on the
/// per-tick debug summaries of the engine targets only, so dependency
/// crates stay at info.
pub fn default_filter(verbose: bool) -> String {
    if !verbose {
        return LevelFilter::Info.to_string();
    }
    let mut filter = LevelFilter::Info.to_string();
    for target in TARGETS {
        filter.push_str(&format!(",{target}={}", LevelFilter::Debug));
    }
    filter
}

/// Installs `env_logger` for the demo binary and tests.
///
/// `RUST_LOG` wins over `verbose`, e.g. `RUST_LOG=avoidance=trace`.
/// Calling this again after a logger is installed does nothing.
pub fn init(verbose: bool) {
    let env = Env::default().default_filter_or(default_filter(verbose));
    let _ = Builder::from_env(env).try_init();
}
