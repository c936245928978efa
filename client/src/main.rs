mod constants;
mod gateway;
mod player;
mod protocol;
mod session;
mod sync;
mod utils;

use anyhow::{Context, Result};
use std::{env, path::PathBuf, sync::Arc, time::Duration};
use tokio::io::{AsyncBufReadExt, BufReader};
use url::Url;

use constants::{DEFAULT_SERVER_URL, VERSION, WS_PATH};
use gateway::Gateway;
use player::{PlayerAdapter, PlayerWatcher, VlcPlayer};
use session::{EventSink, SyncSession};
use sync::RelayClient;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lockstep_client=debug,info".into()),
        )
        .init();

    let base_url = env::var("LOCKSTEP_SERVER").unwrap_or_else(|_| DEFAULT_SERVER_URL.to_string());
    let ws_url = relay_url_from_http(&base_url)
        .with_context(|| format!("Invalid server address {base_url:?}"))?;

    let player = Arc::new(VlcPlayer::new().map_err(|e| anyhow::anyhow!(e))?);
    let gateway = Gateway::new(&base_url);
    let relay = Arc::new(RelayClient::new());

    let session = Arc::new(SyncSession::new(
        Arc::clone(&player) as Arc<dyn PlayerAdapter>,
        Arc::clone(&relay) as Arc<dyn EventSink>,
    ));

    let watcher = PlayerWatcher::spawn(Arc::clone(&player) as Arc<dyn PlayerAdapter>, session.clone());
    tokio::spawn(run_connection_loop(
        Arc::clone(&relay),
        Arc::clone(&session),
        ws_url,
    ));

    // Pick up whatever is already uploaded
    match gateway.current().await {
        Ok(Some(reference)) => {
            let address = gateway.media_url(&reference);
            match player.load_url(&address) {
                Ok(()) => tracing::info!("Loaded current video {}", reference.file_url),
                Err(e) => tracing::warn!("Could not load {}: {}", address, e),
            }
        }
        Ok(None) => tracing::info!("No video uploaded yet; use 'upload <path>'"),
        Err(e) => tracing::warn!("Could not fetch current video: {:#}", e),
    }

    println!("Lockstep client {VERSION} connected to {base_url}. Type 'help' for commands.");
    run_command_loop(&player, &gateway, &relay, &session).await;

    watcher.abort();
    Ok(())
}

/// Derive the relay websocket address from the gateway base URL.
fn relay_url_from_http(base_url: &str) -> Result<String> {
    let parsed = Url::parse(base_url)?;
    let scheme = match parsed.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => anyhow::bail!("Unsupported scheme {other:?}"),
    };

    let mut ws = parsed;
    ws.set_scheme(scheme)
        .map_err(|_| anyhow::anyhow!("Could not derive websocket scheme"))?;
    ws.set_path(WS_PATH);
    ws.set_query(None);
    ws.set_fragment(None);
    Ok(ws.to_string())
}

async fn run_connection_loop(relay: Arc<RelayClient>, session: Arc<SyncSession>, ws_url: String) {
    let mut attempt: u32 = 0;
    loop {
        let handler_session = Arc::clone(&session);
        match relay
            .connect(&ws_url, move |event| handler_session.on_remote_event(event))
            .await
        {
            Ok(disconnect_rx) => {
                attempt = 0;
                relay.mark_connected();
                tracing::info!("Connected to relay at {}", ws_url);
                let _ = disconnect_rx.await;
                relay.mark_disconnected();
                tracing::warn!("Relay connection lost");
            }
            Err(e) => {
                tracing::warn!("Failed to connect to relay at {}: {}", ws_url, e);
            }
        }

        attempt += 1;
        let delay = Duration::from_secs(5 * attempt.min(6) as u64);
        tokio::time::sleep(delay).await;
    }
}

async fn run_command_loop(
    player: &Arc<VlcPlayer>,
    gateway: &Gateway,
    relay: &Arc<RelayClient>,
    session: &Arc<SyncSession>,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::error!("Failed to read input: {}", e);
                break;
            }
        };
        let line = line.trim();
        let (command, arg) = match line.split_once(' ') {
            Some((cmd, rest)) => (cmd, rest.trim()),
            None => (line, ""),
        };

        match command {
            "" => {}
            "help" => print_help(),
            "upload" => {
                if arg.is_empty() {
                    println!("Usage: upload <path>");
                    continue;
                }
                upload_and_load(player, gateway, &PathBuf::from(arg)).await;
            }
            "open" => match gateway.current().await {
                Ok(Some(reference)) => {
                    let address = gateway.media_url(&reference);
                    match player.load_url(&address) {
                        Ok(()) => println!("Loaded {}", reference.file_url),
                        Err(e) => println!("Could not load video: {e}"),
                    }
                }
                Ok(None) => println!("Nothing uploaded yet"),
                Err(e) => println!("Gateway error: {e:#}"),
            },
            "play" => {
                if let Err(e) = player.play() {
                    println!("Play failed: {e}");
                }
            }
            "pause" => {
                if let Err(e) = player.pause() {
                    println!("Pause failed: {e}");
                }
            }
            "seek" => match utils::parse_seek_target(arg) {
                Some(target) => {
                    if let Err(e) = player.seek(target) {
                        println!("Seek failed: {e}");
                    }
                }
                None => println!("Usage: seek <seconds or MM:SS>"),
            },
            "status" => print_status(player, relay, session),
            "clear" => {
                match gateway.clear().await {
                    Ok(()) => {
                        let _ = player.stop();
                        println!("Cleared stored video");
                    }
                    Err(e) => println!("Clear failed: {e:#}"),
                }
            }
            "quit" | "exit" => break,
            other => println!("Unknown command {other:?}; type 'help'"),
        }
    }
}

async fn upload_and_load(player: &Arc<VlcPlayer>, gateway: &Gateway, path: &PathBuf) {
    let mut last_pct = u64::MAX;
    let progress = move |sent: u64, total: u64| {
        let pct = sent * 100 / total.max(1);
        if pct != last_pct && pct % 5 == 0 {
            last_pct = pct;
            println!("Uploading... {pct}%");
        }
    };

    match gateway.upload(path, progress).await {
        Ok(reference) => {
            println!("Uploaded as {}", reference.file_url);
            let address = gateway.media_url(&reference);
            if let Err(e) = player.load_url(&address) {
                println!("Uploaded, but could not load it locally: {e}");
            }
        }
        Err(e) => println!("Upload failed: {e:#}"),
    }
}

fn print_status(player: &Arc<VlcPlayer>, relay: &Arc<RelayClient>, session: &Arc<SyncSession>) {
    let position = utils::format_time(player.current_time());
    let duration = player
        .duration()
        .map(utils::format_time)
        .unwrap_or_else(|| "--:--".into());
    let state = if player.is_paused() { "paused" } else { "playing" };
    println!(
        "{} {} / {}{}",
        state,
        position,
        duration,
        if session.suppressing() {
            " (suppressing echoes)"
        } else {
            ""
        }
    );

    if let Some(source) = player.current_source() {
        println!("source: {source}");
    }

    let stats = relay.stats_snapshot();
    let link = if relay.is_connected() {
        "connected"
    } else {
        "disconnected"
    };
    print!("relay: {link}, {} msgs out / {} in", stats.messages_out, stats.messages_in);
    if let Some(rtt) = stats.last_rtt_ms {
        print!(", rtt {rtt:.0} ms");
    }
    if stats.reconnect_attempts > 0 {
        print!(", {} reconnects", stats.reconnect_attempts);
    }
    println!();
}

fn print_help() {
    println!(
        "Commands:\n  \
         upload <path>  upload a video (.mp4 .mov .avi .mkv) and load it\n  \
         open           load the currently uploaded video\n  \
         play           start playback (synced to everyone)\n  \
         pause          pause playback (synced)\n  \
         seek <t>       jump to a time, seconds or MM:SS (synced)\n  \
         status         playback position and relay stats\n  \
         clear          delete the uploaded video from the server\n  \
         quit           exit"
    );
}
