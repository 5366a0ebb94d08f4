//! Simulate command implementation.
//!
//! Runs a full [`SyncSystem`] against in-memory endpoints whose
//! reachability follows a tick script, and prints a snapshot per tick.

use kiosync_engine::mock::{MockProbe, MockSessionFactory};
use kiosync_engine::{
    CoordinatorConfig, HealthConfig, HealthState, LivenessProbe, SessionFactory, StateSnapshot,
    SyncSettings, SyncSystem,
};
use kiosync_protocol::{CollectionSyncConfig, EndpointId, EndpointPair};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const SETTLE_DELAY: Duration = Duration::from_millis(20);

/// When each endpoint changes reachability. Ticks count from 1.
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Number of ticks to run.
    pub ticks: u32,
    /// Tick at which the primary stops answering.
    pub primary_down: Option<u32>,
    /// Tick at which the primary answers again.
    pub primary_up: Option<u32>,
    /// Tick at which the secondary stops answering.
    pub secondary_down: Option<u32>,
}

impl Script {
    fn validate(&self) -> Result<(), String> {
        if self.ticks == 0 {
            return Err("--ticks must be at least 1".into());
        }
        if let (Some(down), Some(up)) = (self.primary_down, self.primary_up) {
            if up <= down {
                return Err(format!(
                    "--primary-up ({up}) must come after --primary-down ({down})"
                ));
            }
        }
        Ok(())
    }

    /// Reachability changes that take effect at `tick`.
    fn changes_at(&self, tick: u32) -> Vec<(EndpointId, bool)> {
        let mut changes = Vec::new();
        if self.primary_down == Some(tick) {
            changes.push((EndpointId::Primary, false));
        }
        if self.primary_up == Some(tick) {
            changes.push((EndpointId::Primary, true));
        }
        if self.secondary_down == Some(tick) {
            changes.push((EndpointId::Secondary, false));
        }
        changes
    }
}

/// The system as seen after one tick of the script.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Tick number. Zero is the state after start, `ticks + 1` after shutdown.
    pub tick: u32,
    /// Reachability changes applied on this tick.
    pub changes: Vec<(EndpointId, bool)>,
    /// State once the tick settled.
    pub snapshot: StateSnapshot,
}

/// Runs the simulate command.
pub fn run(
    script: &Script,
    collections: &[String],
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    script.validate()?;
    let collections: Vec<CollectionSyncConfig> = collections
        .iter()
        .map(|name| name.trim())
        .filter(|name| !name.is_empty())
        .map(CollectionSyncConfig::new)
        .collect();
    if collections.is_empty() {
        return Err("at least one collection is required".into());
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let frames = runtime.block_on(simulate(script, &collections))?;
    for frame in &frames {
        print_frame(frame, format)?;
    }
    Ok(())
}

async fn simulate(
    script: &Script,
    collections: &[CollectionSyncConfig],
) -> Result<Vec<Frame>, Box<dyn std::error::Error>> {
    let probe = Arc::new(MockProbe::new());
    let factory = Arc::new(MockSessionFactory::new());
    let system = SyncSystem::new(
        settings(),
        Arc::clone(&probe) as Arc<dyn LivenessProbe>,
        factory as Arc<dyn SessionFactory>,
    )?;

    system.start(collections).await?;
    // Ticks are driven by hand below.
    system.health().stop();
    let mut frames = vec![Frame {
        tick: 0,
        changes: Vec::new(),
        snapshot: system.snapshot(),
    }];

    for tick in 1..=script.ticks {
        let changes = script.changes_at(tick);
        debug!(tick, ?changes, "running tick");
        for (endpoint, healthy) in &changes {
            probe.set_healthy(*endpoint, *healthy);
        }

        system.health().check_now().await;
        settle(&system).await;
        frames.push(Frame {
            tick,
            changes,
            snapshot: system.snapshot(),
        });
    }

    system.shutdown().await;
    frames.push(Frame {
        tick: script.ticks + 1,
        changes: Vec::new(),
        snapshot: system.snapshot(),
    });
    Ok(frames)
}

fn settings() -> SyncSettings {
    let endpoints = EndpointPair::new(
        "http://primary.sim",
        "ws://primary.sim",
        "http://secondary.sim",
        "ws://secondary.sim",
    );
    SyncSettings::new(endpoints)
        .with_health(
            HealthConfig::default()
                .with_interval(Duration::from_secs(3600))
                .with_probe_timeout(Duration::from_secs(1)),
        )
        .with_coordinator(CoordinatorConfig::default().with_settle_delay(SETTLE_DELAY))
}

/// Waits for any transition triggered by the last tick to finish.
async fn settle(system: &SyncSystem) {
    // Busy events are re-raised after one settle delay.
    tokio::time::sleep(SETTLE_DELAY * 3).await;
    let mut states = system.coordinator().subscribe();
    let _ = states.wait_for(|state| !state.is_processing).await;
}

fn print_frame(frame: &Frame, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        "json" => {
            let line = serde_json::json!({ "tick": frame.tick, "snapshot": frame.snapshot });
            println!("{}", serde_json::to_string(&line)?);
        }
        _ => println!("{}", render_line(frame.tick, &frame.changes, &frame.snapshot)),
    }
    Ok(())
}

fn render_line(tick: u32, changes: &[(EndpointId, bool)], snapshot: &StateSnapshot) -> String {
    let health = snapshot
        .health
        .iter()
        .map(render_health)
        .collect::<Vec<_>>()
        .join("  ");
    let live = snapshot
        .sessions
        .iter()
        .filter(|session| session.was_started)
        .count();

    let mut line = format!(
        "tick {tick:>3}  state={:<9}  {health}  live={live}/{}",
        snapshot.state.to_string(),
        snapshot.sessions.len()
    );
    if snapshot.both_unavailable {
        line.push_str("  [both unavailable]");
    }
    for (endpoint, healthy) in changes {
        let verb = if *healthy { "up" } else { "down" };
        line.push_str(&format!("  <- {endpoint} {verb}"));
    }
    line
}

fn render_health(state: &HealthState) -> String {
    let status = match serde_json::to_value(state.status) {
        Ok(serde_json::Value::String(status)) => status,
        _ => format!("{:?}", state.status),
    };
    format!("{}={status}({})", state.endpoint, state.consecutive_failures)
}
