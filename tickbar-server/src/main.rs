//! WebSocket bridge around the tickbar engine.
//!
//! Consumes an upstream tick feed, runs the aggregation engine for a
//! configured instrument/timeframe set, and re-broadcasts candle updates to
//! downstream WebSocket clients. Reconnection to the upstream feed is this
//! binary's responsibility, not the engine's.

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use smol_str::SmolStr;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tickbar::{
    BarUpdate, Engine, EngineConfig, FileSnapshotStore, RestHistoricalSource, Tick,
    TimeframeRegistry,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, watch},
};
use tokio_tungstenite::{accept_async, connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Connection status for the upstream tick feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FeedStatus {
    Connected,
    Disconnected,
    Reconnecting,
}

/// Messages from the upstream tick feed.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum FeedMessage {
    #[serde(rename = "tick")]
    Tick {
        instrument: String,
        bid: f64,
        ask: f64,
        ts: i64,
    },
    #[serde(rename = "welcome")]
    Welcome {
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(rename = "status")]
    Status {
        #[serde(default)]
        connected: Option<bool>,
    },
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() {
    init_logging();
    info!("starting tickbar server");

    let feed_url = env_or("TICKBAR_FEED_URL", "ws://127.0.0.1:8765/ws");
    let history_url = env_or("TICKBAR_HISTORY_URL", "http://127.0.0.1:8080");
    let data_dir = env_or("TICKBAR_DATA_DIR", "./data");
    let server_addr_str = env_or("TICKBAR_WS_ADDR", "0.0.0.0:9001");
    let server_addr = match server_addr_str.parse::<SocketAddr>() {
        Ok(addr) => addr,
        Err(parse_error) => {
            error!(%server_addr_str, %parse_error, "invalid TICKBAR_WS_ADDR");
            return;
        }
    };
    let instruments: Vec<SmolStr> = env_or("TICKBAR_INSTRUMENTS", "EURUSD,GBPUSD,USDJPY")
        .split(',')
        .map(|s| SmolStr::new(s.trim()))
        .filter(|s| !s.is_empty())
        .collect();
    let timeframes: Vec<String> = env_or("TICKBAR_TIMEFRAMES", "M1,M5,H1")
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    let engine = Arc::new(Engine::new(
        EngineConfig::default(),
        TimeframeRegistry::with_defaults(),
        Arc::new(RestHistoricalSource::new(history_url.clone())),
        Arc::new(FileSnapshotStore::new(data_dir.clone())),
    ));
    info!(%history_url, %data_dir, "engine initialised");

    // Downstream broadcast of candle updates to connected clients
    let buffer_size = env_or("TICKBAR_WS_BUFFER_SIZE", "10000")
        .parse()
        .unwrap_or(10_000);
    let (updates_tx, _rx) = broadcast::channel::<BarUpdate>(buffer_size);
    let updates_tx = Arc::new(updates_tx);

    // Subscribe the configured instrument x timeframe grid and forward each
    // series' notification stream into the shared broadcast channel
    for instrument in &instruments {
        for timeframe in &timeframes {
            match engine.subscribe(instrument, timeframe) {
                Ok(mut subscription) => {
                    let updates_tx = Arc::clone(&updates_tx);
                    tokio::spawn(async move {
                        while let Some(update) = subscription.updates.next().await {
                            match update {
                                Ok(update) => {
                                    let _ = updates_tx.send(update);
                                }
                                Err(lag) => {
                                    warn!(%lag, "series update stream lagged");
                                }
                            }
                        }
                    });
                }
                Err(subscribe_error) => {
                    warn!(%instrument, %timeframe, %subscribe_error, "subscription failed");
                }
            }
        }
    }

    let listener_updates = Arc::clone(&updates_tx);
    tokio::spawn(async move {
        start_websocket_server(server_addr, listener_updates).await;
    });
    info!("candle broadcast listening on ws://{server_addr}");

    let (status_tx, mut status_rx) = watch::channel(FeedStatus::Disconnected);
    tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { run_feed(feed_url, engine, status_tx).await }
    });
    tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            info!(status = ?*status_rx.borrow(), "upstream feed status");
        }
    });

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!(metrics = ?engine.metrics(), "shutting down"),
        Err(signal_error) => error!(%signal_error, "failed to listen for shutdown signal"),
    }
}

/// Upstream feed handler: connect, parse, forward ticks into the engine,
/// reconnect after 5s on any failure.
async fn run_feed(url: String, engine: Arc<Engine>, status_tx: watch::Sender<FeedStatus>) {
    info!(%url, "starting upstream feed handler");

    loop {
        let _ = status_tx.send(FeedStatus::Reconnecting);

        match connect_async(&url).await {
            Ok((ws_stream, _)) => {
                info!(%url, "connected to upstream feed");
                let _ = status_tx.send(FeedStatus::Connected);

                let (_, read) = ws_stream.split();
                let ticks = read
                    .take_while(|msg| {
                        let proceed = match msg {
                            Ok(Message::Close(_)) => {
                                warn!("upstream feed closed the connection");
                                false
                            }
                            Err(ws_error) => {
                                error!(%ws_error, "upstream feed error");
                                false
                            }
                            _ => true,
                        };
                        futures::future::ready(proceed)
                    })
                    .filter_map(|msg| async move {
                        let Ok(Message::Text(text)) = msg else {
                            return None;
                        };
                        match serde_json::from_str::<FeedMessage>(&text) {
                            Ok(FeedMessage::Tick {
                                instrument,
                                bid,
                                ask,
                                ts,
                            }) => Some(Tick::new(SmolStr::new(instrument), bid, ask, ts)),
                            Ok(FeedMessage::Welcome { message }) => {
                                debug!(?message, "feed welcome");
                                None
                            }
                            Ok(FeedMessage::Status { connected }) => {
                                debug!(?connected, "feed status");
                                None
                            }
                            Err(parse_error) => {
                                debug!(
                                    %parse_error,
                                    payload = &text[..text.len().min(100)],
                                    "unparseable feed message"
                                );
                                None
                            }
                        }
                    });

                // Drains until the connection drops, then we reconnect
                engine.run(ticks).await;

                let _ = status_tx.send(FeedStatus::Disconnected);
            }
            Err(connect_error) => {
                error!(%url, %connect_error, "failed to connect to upstream feed");
                let _ = status_tx.send(FeedStatus::Disconnected);
            }
        }

        debug!("waiting 5 seconds before reconnecting to upstream feed");
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

/// Accept downstream clients and fan candle updates out to each of them.
async fn start_websocket_server(addr: SocketAddr, tx: Arc<broadcast::Sender<BarUpdate>>) {
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(bind_error) => {
            error!(%addr, %bind_error, "failed to bind candle broadcast server");
            return;
        }
    };

    info!(%addr, "candle broadcast server bound");

    while let Ok((stream, peer_addr)) = listener.accept().await {
        info!(%peer_addr, "new client connection");
        let tx = Arc::clone(&tx);
        tokio::spawn(handle_client(stream, peer_addr, tx));
    }
}

/// Handle one downstream client connection.
async fn handle_client(stream: TcpStream, peer_addr: SocketAddr, tx: Arc<broadcast::Sender<BarUpdate>>) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(handshake_error) => {
            error!(%peer_addr, %handshake_error, "websocket handshake failed");
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let mut rx = tx.subscribe();

    let welcome = serde_json::json!({
        "type": "welcome",
        "message": "connected to tickbar candle feed",
        "timestamp": Utc::now(),
    });
    if let Ok(msg) = serde_json::to_string(&welcome) {
        let _ = ws_sender.send(Message::Text(msg.into())).await;
    }

    let mut send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(update) => {
                    if let Ok(json) = serde_json::to_string(&update)
                        && ws_sender.send(Message::Text(json.into())).await.is_err()
                    {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Slow client under load; skip rather than disconnect
                    warn!(%peer_addr, skipped, "client lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Ok(Message::Ping(_)) => {
                    debug!(%peer_addr, "ping");
                }
                Ok(Message::Text(text)) => {
                    debug!(%peer_addr, %text, "client message");
                }
                Err(ws_error) => {
                    error!(%peer_addr, %ws_error, "client websocket error");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => {},
        _ = &mut recv_task => {},
    }

    info!(%peer_addr, "client connection closed");
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
