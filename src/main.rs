mod apdu;
mod controller;
mod discovery;
mod error;
mod mifare;
mod ndef;
mod records;
mod session;
mod types;
mod ws;

use std::sync::{Arc, Mutex};

use crossbeam_channel::unbounded;
use tokio::sync::broadcast;

use controller::{ChannelSink, TagController};
use discovery::Coordinator;

#[tokio::main]
async fn main() {
    env_logger::init();
    log::info!("starting NDEF tag service");

    // WS -> NFC commands (crossbeam, the NFC thread is blocking)
    let (cmd_tx, cmd_rx) = unbounded::<types::NfcCommand>();

    // NFC -> WS events, bridged into a tokio broadcast for the clients
    let (event_tx, event_rx) = broadcast::channel::<types::OutgoingMessage>(100);

    let (bridge_tx, bridge_rx) = unbounded::<types::OutgoingMessage>();

    let controller = Arc::new(Mutex::new(TagController::new(Box::new(ChannelSink::new(
        bridge_tx.clone(),
    )))));
    let coordinator = Coordinator::new(controller);

    // Blocking NFC thread: discovery loop + tag workers
    std::thread::spawn(move || {
        discovery::run(coordinator, bridge_tx, cmd_rx);
    });

    // Bridge thread: sync channel -> async broadcast
    let event_tx_clone = event_tx.clone();
    std::thread::spawn(move || {
        while let Ok(msg) = bridge_rx.recv() {
            let _ = event_tx_clone.send(msg);
        }
    });

    ws::start_server(cmd_tx, event_rx).await;
}
