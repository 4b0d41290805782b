// src/ws.rs
use crate::session::ConnectionMode;
use crate::types::{IncomingMessage, NfcCommand, OutgoingMessage};
use crossbeam_channel::Sender;
use futures::{SinkExt, StreamExt};
use log::{info, warn};
use std::sync::Arc;
use tokio::sync::broadcast;
use warp::Filter;

pub async fn start_server(
    nfc_cmd_tx: Sender<NfcCommand>,
    mut nfc_event_rx: broadcast::Receiver<OutgoingMessage>,
) {
    // Shared broadcast channel for WS clients
    let (ws_tx, _) = broadcast::channel::<OutgoingMessage>(32);
    let ws_tx = Arc::new(ws_tx);

    // Forward NFC events -> all WS clients
    let ws_tx_clone = ws_tx.clone();
    tokio::spawn(async move {
        while let Ok(msg) = nfc_event_rx.recv().await {
            let _ = ws_tx_clone.send(msg);
        }
    });

    let ws_route = warp::path::end()
        .and(warp::ws())
        .map(move |ws: warp::ws::Ws| {
            let nfc_cmd_tx = nfc_cmd_tx.clone();
            let ws_tx = ws_tx.clone();
            ws.on_upgrade(move |socket| handle_connection(socket, nfc_cmd_tx, ws_tx))
        });

    let routes = ws_route.with(warp::cors().allow_any_origin());

    info!("WebSocket server running on ws://127.0.0.1:3500");
    warp::serve(routes).run(([127, 0, 0, 1], 3500)).await;
}

async fn handle_connection(
    ws: warp::ws::WebSocket,
    nfc_cmd_tx: Sender<NfcCommand>,
    ws_tx: Arc<broadcast::Sender<OutgoingMessage>>,
) {
    let (mut client_ws_tx, mut client_ws_rx) = ws.split();
    let mut rx_broadcast = ws_tx.subscribe();

    // Broadcasts -> client
    tokio::spawn(async move {
        while let Ok(msg) = rx_broadcast.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(err) => {
                    warn!("failed to serialize event: {err}");
                    continue;
                }
            };
            if client_ws_tx
                .send(warp::ws::Message::text(json))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    // Commands from the client
    while let Some(result) = client_ws_rx.next().await {
        let Ok(msg) = result else { break };
        if !msg.is_text() {
            continue;
        }
        let Ok(text) = msg.to_str() else { continue };
        match serde_json::from_str::<IncomingMessage>(text) {
            Ok(IncomingMessage::GET_READER_STATUS) => {
                let _ = nfc_cmd_tx.send(NfcCommand::CheckReaderStatus);
            }
            Ok(IncomingMessage::SET_MODE { raw }) => {
                let mode = if raw {
                    ConnectionMode::Raw
                } else {
                    ConnectionMode::Ndef
                };
                let _ = nfc_cmd_tx.send(NfcCommand::SetMode(mode));
            }
            Ok(IncomingMessage::SET_OPERATION(op)) => {
                info!("incoming operation: {op:?}");
                let _ = nfc_cmd_tx.send(NfcCommand::SetOperation(op));
            }
            Err(err) => warn!("ignoring malformed command: {err}"),
        }
    }
}
