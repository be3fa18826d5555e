use std::io::{self, BufRead};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{error, info};

use pulse_sync::protocol::{AUTO_CONNECT_KEY, TOKEN_KEY, USER_ID_KEY};
use pulse_sync::store::{JsonFileStore, KeyValueStore};
use pulse_sync::sync_client::{SyncClient, SyncClientConfig};
use pulse_sync::transport::ReqwestTransport;
use pulse_sync::types::{SyncEvent, Variant, Visibility};

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // Set RUST_LOG=debug for verbose output, e.g.:
    //   RUST_LOG=pulse_sync=debug cargo run
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // ── Configuration ─────────────────────────────────────────────────────────
    let config = SyncClientConfig::from_env()?;
    let store_path =
        std::env::var("PULSE_STORE_PATH").unwrap_or_else(|_| "pulse-sync.json".into());
    let store = Arc::new(
        JsonFileStore::open(&store_path).with_context(|| format!("opening {store_path}"))?,
    );

    // Credentials normally come from the sign-in flow; the environment can
    // seed them for headless use.
    if let Ok(token) = std::env::var("PULSE_TOKEN") {
        store.set(TOKEN_KEY, &token);
    }
    if let Ok(user) = std::env::var("PULSE_USER_ID") {
        store.set(USER_ID_KEY, &user);
    }

    info!(
        "device={} backend={} variant={:?} store={}",
        config.device_base_url,
        config.backend_base_url,
        config.variant,
        store.path().display()
    );

    let variant = config.variant;
    let http = Arc::new(ReqwestTransport::new(config.request_timeout)?);
    let (client, mut rx) = SyncClient::new(config, http, store.clone());
    let handle = client.spawn();

    // ── Start-up ──────────────────────────────────────────────────────────────
    match handle.start().await {
        Ok(true) => info!("Resumed polling from the stored session."),
        Ok(false) => info!("Idle. Type 'c' + Enter to connect."),
        Err(e) => error!("Cannot resume: {e}"),
    }
    info!("Commands (type + Enter):");
    info!("  c  – connect");
    info!("  d  – disconnect");
    info!("  h  – page hidden (background variant polls every 10 s)");
    info!("  v  – page visible");
    info!("  a  – enable auto-connect and start the background loop");
    info!("  s  – show status");
    info!("  q  – quit\n");

    // ── Stdin command loop ────────────────────────────────────────────────────
    // Lines are read on a dedicated OS thread and relayed to an async task.
    let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(l) => {
                    if line_tx.send(l.trim().to_owned()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let handle_cmd = handle.clone();
    let store_cmd = store.clone();
    tokio::spawn(async move {
        while let Some(line) = line_rx.recv().await {
            let result = match line.as_str() {
                "" => continue,
                "q" => {
                    info!("Quit requested.");
                    handle_cmd.shutdown().await;
                    break;
                }
                "c" => handle_cmd.connect().await,
                "d" => handle_cmd.disconnect().await,
                "h" => handle_cmd.set_visibility(Visibility::Hidden).await,
                "v" => handle_cmd.set_visibility(Visibility::Visible).await,
                "a" if variant == Variant::Background => {
                    store_cmd.set_flag(AUTO_CONNECT_KEY, true);
                    handle_cmd.start().await.map(|_| ())
                }
                "a" => {
                    info!("Auto-connect applies to the background variant (PULSE_VARIANT=background).");
                    Ok(())
                }
                "s" => handle_cmd.status().await.map(|s| println!("{s:#?}")),
                other => {
                    info!("Unknown command '{other}'");
                    Ok(())
                }
            };
            if let Err(e) = result {
                error!("{e}");
            }
        }
    });

    // ── Main event loop ───────────────────────────────────────────────────────
    while let Some(event) = rx.recv().await {
        match event {
            SyncEvent::StateChanged(state) => println!("[STATE] {state}"),
            SyncEvent::Reading(r) => println!(
                "[READING] hr={:5.1} bpm  spo2={:5.1} %  ir={:8.0}  red={:8.0}",
                r.heart_rate, r.spo2, r.ir, r.red
            ),
            SyncEvent::Forwarded(Some(id)) => println!("[SYNC] stored reading_id={id}"),
            SyncEvent::Forwarded(None) => println!("[SYNC] stored"),
            SyncEvent::Error(reason) => println!("[ERROR] {reason}"),
            SyncEvent::ErrorCleared => println!("[ERROR] cleared"),
            SyncEvent::TransportChanged(mode) => println!("[TRANSPORT] {mode}"),
            SyncEvent::AutoConnectDisabled => {
                println!("[AUTO] disabled after repeated failures; press 'a' to re-enable")
            }
            SyncEvent::Stopped => println!("[POLL] stopped"),
        }
    }

    info!("Event loop finished – exiting.");
    Ok(())
}
