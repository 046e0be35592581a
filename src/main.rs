//! Secure Cache - line-oriented bridge
//!
//! Exposes the process-wide cache over stdin/stdout, one command per line and one
//! JSON reply per line. Logs go to stderr.
//!
//! # Commands
//! - `SET <key> <json> [ttl_ms]`
//! - `GET <key>`
//! - `DEL <key>`
//! - `CLEAR`, `STATS`, `ROTATE`, `REAP`, `QUIT`

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use secure_cache::{global, EventKind, SecureCache, SetOptions};

/// Main entry point for the secure cache bridge.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Create the default cache from environment variables (starts the reaper)
/// 3. Subscribe event listeners that log cache health events
/// 4. Install the termination hook (Ctrl+C or SIGTERM shuts the cache down)
/// 5. Serve commands until EOF, `QUIT` or the hook fires
/// 6. Shut the cache down, wiping entries and key material
#[tokio::main]
async fn main() -> Result<()> {
    // Defaults to "secure_cache=info", can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "secure_cache=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("Starting Secure Cache bridge");

    let cache = global::instance().context("failed to create the default cache")?;
    info!("Configuration loaded: {:?}", cache.config());

    cache.on(EventKind::MemoryPressure, |event| {
        warn!("memory_pressure: {}", serde_json::to_string(event).unwrap_or_default());
    })?;
    cache.on(EventKind::SuspiciousAccess, |event| {
        warn!("suspicious_access: {}", serde_json::to_string(event).unwrap_or_default());
    })?;

    let mut hook = global::install_shutdown_hook();
    let outcome = tokio::select! {
        result = run_bridge(&cache) => result,
        _ = &mut hook => Ok(()),
    };

    // Both are no-ops once the hook has run
    hook.abort();
    global::shutdown().await;
    info!("Secure Cache bridge shutdown complete");
    outcome
}

async fn run_bridge(cache: &SecureCache) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let reply = match parse_command(line) {
            Ok(command) => execute(cache, command).await,
            Err(err) => Err(err),
        };
        match reply {
            Ok(Some(value)) => println!("{}", value),
            Ok(None) => break,
            Err(err) => println!("{}", json!({ "error": format!("{:#}", err) })),
        }
    }
    Ok(())
}

// == Commands ==
#[derive(Debug, Clone, PartialEq)]
enum Command {
    Set {
        key: String,
        value: Value,
        ttl: Option<Duration>,
    },
    Get(String),
    Delete(String),
    Clear,
    Stats,
    Rotate,
    Reap,
    Quit,
}

fn parse_command(line: &str) -> Result<Command> {
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };

    let command = match verb.to_ascii_uppercase().as_str() {
        "SET" => {
            let (key, payload) = rest
                .split_once(char::is_whitespace)
                .context("usage: SET <key> <json> [ttl_ms]")?;
            let payload = payload.trim();
            let (value, ttl) = match serde_json::from_str::<Value>(payload) {
                Ok(value) => (value, None),
                Err(_) => {
                    let (json_part, ttl_part) = payload
                        .rsplit_once(char::is_whitespace)
                        .context("invalid JSON value")?;
                    let value =
                        serde_json::from_str(json_part.trim()).context("invalid JSON value")?;
                    let ttl_ms: u64 = ttl_part.parse().context("invalid ttl_ms")?;
                    (value, Some(Duration::from_millis(ttl_ms)))
                }
            };
            Command::Set {
                key: key.to_string(),
                value,
                ttl,
            }
        }
        "GET" => Command::Get(single_arg(rest, "GET")?),
        "DEL" => Command::Delete(single_arg(rest, "DEL")?),
        "CLEAR" => Command::Clear,
        "STATS" => Command::Stats,
        "ROTATE" => Command::Rotate,
        "REAP" => Command::Reap,
        "QUIT" | "EXIT" => Command::Quit,
        other => bail!("unknown command: {}", other),
    };
    Ok(command)
}

fn single_arg(rest: &str, verb: &str) -> Result<String> {
    if rest.is_empty() || rest.contains(char::is_whitespace) {
        bail!("usage: {} <key>", verb);
    }
    Ok(rest.to_string())
}

/// Runs one command. `Ok(None)` ends the session.
async fn execute(cache: &SecureCache, command: Command) -> Result<Option<Value>> {
    let reply = match command {
        Command::Set { key, value, ttl } => {
            cache
                .set(key, value, SetOptions { ttl, compress: None })
                .await?;
            json!({ "ok": true })
        }
        Command::Get(key) => match cache.get(&key).await? {
            Some(value) => json!({ "found": true, "value": value }),
            None => json!({ "found": false }),
        },
        Command::Delete(key) => json!({ "deleted": cache.delete(&key).await? }),
        Command::Clear => {
            cache.clear().await?;
            json!({ "ok": true })
        }
        Command::Stats => serde_json::to_value(cache.stats().await)?,
        Command::Rotate => json!({ "key_version": cache.rotate_key().await? }),
        Command::Reap => serde_json::to_value(cache.reap_expired().await?)?,
        Command::Quit => return Ok(None),
    };
    Ok(Some(reply))
}
