//! owbus-scan: enumerate the configured buses and dump every device's
//! readable properties as JSON.

use anyhow::{Context, Result};
use serde_json::{json, Map, Value as Json};

use owbus::adapter::fake::FakeAdapter;
use owbus::adapter::{AdapterFlags, BusSpeed, Transport};
use owbus::config::Config;
use owbus::connection::{Connection, ConnectionRegistry};
use owbus::device::{DeviceRegistry, SiblingCache};
use owbus::search::SearchMode;
use owbus::tracing::{self, prelude::*};
use owbus::transaction::{Step, Target};

fn main() -> Result<()> {
    tracing::init_journald_or_stdout();

    let config = Config::load().context("loading configuration")?;
    let devices = DeviceRegistry::builtin(config.settings()).context("building device catalog")?;
    let buses = ConnectionRegistry::new(config.bus.reconnect_limit);

    for transport in &config.adapters {
        match transport {
            Transport::Fake { devices } => {
                let adapter = FakeAdapter::with_addresses(devices);
                buses.open(transport.clone(), Box::new(adapter))?;
            }
            other => {
                warn!(kind = %other.kind(), "adapter needs an external transport, skipped");
            }
        }
    }
    info!(buses = buses.len(), families = devices.catalog().len(), "Started.");

    let mut report = Vec::new();
    for connection in buses.connections() {
        if config.bus.overdrive && connection.flags().contains(AdapterFlags::OVERDRIVE) {
            connection.transaction(
                &Target::broadcast(),
                &mut [Step::Select, Step::Speed(BusSpeed::Overdrive), Step::End],
            )?;
        }
        report.push(scan(&devices, &connection));
    }
    println!("{}", serde_json::to_string_pretty(&report)?);

    buses.close_all();
    info!("Exiting.");
    Ok(())
}

fn scan(devices: &DeviceRegistry, connection: &Connection) -> Json {
    let found = match connection.search(SearchMode::Normal) {
        Ok(found) => found,
        Err(e) => {
            error!(bus = connection.index(), error = %e, "search failed");
            return json!({
                "bus": connection.index(),
                "adapter": connection.adapter_name(),
                "error": e.to_string(),
            });
        }
    };

    let listed: Vec<Json> = found
        .into_iter()
        .map(|address| {
            let Some(family) = devices.catalog().family(address.family()) else {
                return json!({ "address": address, "type": Json::Null });
            };
            let target = Target::device(address);
            let mut cache = SiblingCache::new();
            let mut properties = Map::new();
            for resolved in devices.listing(family) {
                let value = match devices.read(connection, &target, &resolved, &mut cache) {
                    Ok(value) => json!(value),
                    Err(e) => {
                        debug!(device = %address, property = %resolved.path(), error = %e, "read failed");
                        json!({ "error": e.to_string() })
                    }
                };
                properties.insert(resolved.path(), value);
            }
            json!({ "address": address, "type": family.name, "properties": properties })
        })
        .collect();

    json!({
        "bus": connection.index(),
        "adapter": connection.adapter_name(),
        "kind": connection.kind(),
        "state": connection.state().to_string(),
        "devices": listed,
        "statistics": connection.stats(),
    })
}
