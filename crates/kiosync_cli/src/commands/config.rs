//! Config command implementation.

use crate::EndpointArgs;
use kiosync_engine::{
    SyncSettings, ENV_PRIMARY_STREAM_URL, ENV_PRIMARY_URL, ENV_SECONDARY_STREAM_URL,
    ENV_SECONDARY_URL,
};

/// Runs the config command.
pub fn run(endpoints: &EndpointArgs, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let settings = resolve(endpoints, |key| std::env::var(key).ok())?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&settings)?),
        _ => print_text(&settings),
    }
    Ok(())
}

/// Resolves settings, with flags taking precedence over `env`.
fn resolve<F>(endpoints: &EndpointArgs, env: F) -> Result<SyncSettings, Box<dyn std::error::Error>>
where
    F: Fn(&str) -> Option<String>,
{
    let settings = SyncSettings::from_lookup(|key| {
        let flag = match key {
            ENV_PRIMARY_URL => endpoints.primary_url.clone(),
            ENV_PRIMARY_STREAM_URL => endpoints.primary_stream_url.clone(),
            ENV_SECONDARY_URL => endpoints.secondary_url.clone(),
            ENV_SECONDARY_STREAM_URL => endpoints.secondary_stream_url.clone(),
            _ => None,
        };
        flag.or_else(|| env(key))
    })?;
    Ok(settings)
}

fn print_text(settings: &SyncSettings) {
    println!("=== Endpoints ===");
    for endpoint in settings.endpoints.iter() {
        println!("{:<10} {}", endpoint.id, endpoint.base_url);
        println!("{:<10} {}", "", endpoint.stream_url);
    }
    println!();

    println!("=== Health ===");
    println!("Interval:        {:?}", settings.health.interval);
    println!("Probe timeout:   {:?}", settings.health.probe_timeout);
    println!("Degraded after:  {} failures", settings.health.degraded_after);
    println!("Offline after:   {} failures", settings.health.offline_after);
    println!("Probe path:      {}", settings.health.probe_path);
    println!();

    println!("=== Failover ===");
    println!("Settle delay:    {:?}", settings.coordinator.settle_delay);
    println!("Event capacity:  {}", settings.coordinator.event_capacity);
    println!();

    println!("=== Sessions ===");
    println!("Poll interval:   {:?}", settings.session.poll_interval);
    match settings.session.pull_batch_size {
        0 => println!("Pull batch:      per collection"),
        size => println!("Pull batch:      {size}"),
    }
    println!("Push batch:      {}", settings.session.push_batch_size);
}
