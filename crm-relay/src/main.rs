//! CRM relay server.
//!
//! Runs the content-agnostic room relay. Configuration comes from the
//! environment:
//!
//! | Variable                   | Default          |
//! |----------------------------|------------------|
//! | `RELAY_BIND`               | `127.0.0.1:9090` |
//! | `PORT`                     | binds `0.0.0.0:$PORT` when `RELAY_BIND` is unset |
//! | `RELAY_PATH`               | `/sync`          |
//! | `RELAY_DEFAULT_ROOM`       | `crm`            |
//! | `RELAY_BROADCAST_CAPACITY` | `256`            |
//! | `RELAY_IDLE_TIMEOUT_SECS`  | `60`             |
//! | `RELAY_WRITE_TIMEOUT_SECS` | `10`             |
//!
//! Log level follows `RUST_LOG` (default `info`).

use std::str::FromStr;

use crm_collab::{RelayServer, ServerConfig};
use log::{error, info, warn};

fn config_from<F>(lookup: F) -> ServerConfig
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = ServerConfig::default();

    if let Some(bind) = lookup("RELAY_BIND") {
        config.bind_addr = bind;
    } else if let Some(port) = parsed::<u16, _>(&lookup, "PORT") {
        config.bind_addr = format!("0.0.0.0:{port}");
    }
    if let Some(path) = lookup("RELAY_PATH") {
        config.path = path;
    }
    if let Some(room) = lookup("RELAY_DEFAULT_ROOM") {
        config.default_room = room;
    }
    if let Some(capacity) = parsed::<usize, _>(&lookup, "RELAY_BROADCAST_CAPACITY") {
        config.broadcast_capacity = capacity.max(1);
    }
    if let Some(secs) = parsed(&lookup, "RELAY_IDLE_TIMEOUT_SECS") {
        config.idle_timeout_secs = secs;
    }
    if let Some(secs) = parsed(&lookup, "RELAY_WRITE_TIMEOUT_SECS") {
        config.write_timeout_secs = secs;
    }

    config
}

fn parsed<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring {key}={raw:?}: not a valid value");
            None
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = config_from(|key| std::env::var(key).ok());
    info!(
        "Starting CRM relay on {}{} (default room {:?})",
        config.bind_addr, config.path, config.default_room
    );

    let server = RelayServer::new(config);
    if let Err(e) = server.run().await {
        error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_env() {
        let config = config_from(env(&[]));
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.path, "/sync");
        assert_eq!(config.default_room, "crm");
    }

    #[test]
    fn test_port_binds_all_interfaces() {
        let config = config_from(env(&[("PORT", "3000")]));
        assert_eq!(config.bind_addr, "0.0.0.0:3000");
    }

    #[test]
    fn test_relay_bind_wins_over_port() {
        let config = config_from(env(&[("PORT", "3000"), ("RELAY_BIND", "127.0.0.1:7000")]));
        assert_eq!(config.bind_addr, "127.0.0.1:7000");
    }

    #[test]
    fn test_overrides() {
        let config = config_from(env(&[
            ("RELAY_PATH", "/realtime"),
            ("RELAY_DEFAULT_ROOM", "sales"),
            ("RELAY_BROADCAST_CAPACITY", "1024"),
            ("RELAY_IDLE_TIMEOUT_SECS", "5"),
            ("RELAY_WRITE_TIMEOUT_SECS", "3"),
        ]));
        assert_eq!(config.path, "/realtime");
        assert_eq!(config.default_room, "sales");
        assert_eq!(config.broadcast_capacity, 1024);
        assert_eq!(config.idle_timeout_secs, 5);
        assert_eq!(config.write_timeout_secs, 3);
    }

    #[test]
    fn test_bad_numbers_fall_back() {
        let config = config_from(env(&[
            ("PORT", "not-a-port"),
            ("RELAY_BROADCAST_CAPACITY", "-4"),
            ("RELAY_IDLE_TIMEOUT_SECS", "soon"),
            ("RELAY_WRITE_TIMEOUT_SECS", "1.5"),
        ]));
        let defaults = ServerConfig::default();
        assert_eq!(config.bind_addr, defaults.bind_addr);
        assert_eq!(config.broadcast_capacity, defaults.broadcast_capacity);
        assert_eq!(config.idle_timeout_secs, defaults.idle_timeout_secs);
        assert_eq!(config.write_timeout_secs, defaults.write_timeout_secs);
    }
}
