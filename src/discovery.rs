// src/discovery.rs
//
// Watches the PC/SC layer for tag arrivals and hands ready sessions to a
// worker thread, one touch at a time. The coordinator owns the only
// session reference outside the worker.

use std::ffi::{CStr, CString};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use log::{error, info, warn};
use pcsc::{Context, PNP_NOTIFICATION, Protocols, ReaderState, Scope, ShareMode, State};

use crate::controller::TagController;
use crate::error::TagError;
use crate::mifare::{CardKind, MifareTag, TlvNdefChannel};
use crate::session::{NdefChannel, RawTag, TagSession, Target};
use crate::types::{MIFARE_RAW_TOKEN, NfcCommand, OutgoingMessage, Severity};

// ATR card-type bytes as reported by the reader driver.
const CARD_TYPE_MIFARE_1K: u8 = 0x6A;
const CARD_TYPE_NTAG: u8 = 0x68;

/// A tag that appeared on a PC/SC reader. The already-open card handle is
/// consumed by whichever open_* call the session makes.
pub struct PcscTarget {
    card: Mutex<Option<pcsc::Card>>,
    kind: CardKind,
}

impl PcscTarget {
    pub fn new(card: pcsc::Card, kind: CardKind) -> PcscTarget {
        PcscTarget {
            card: Mutex::new(Some(card)),
            kind,
        }
    }

    fn take_card(&self) -> Result<pcsc::Card, TagError> {
        self.card
            .lock()
            .map_err(|_| TagError::Transport("target handle poisoned".into()))?
            .take()
            .ok_or_else(|| TagError::Transport("target already opened".into()))
    }
}

impl Target for PcscTarget {
    fn supports_ndef(&self) -> bool {
        // Both supported technologies carry NDEF behind the TLV container.
        true
    }

    fn connection_name(&self) -> &str {
        match self.kind {
            CardKind::Classic1k => MIFARE_RAW_TOKEN,
            CardKind::Ntag => "ntag",
        }
    }

    fn open_ndef(&self) -> Result<Box<dyn NdefChannel>, TagError> {
        Ok(Box::new(TlvNdefChannel::new(self.take_card()?, self.kind)))
    }

    fn open_raw(&self) -> Result<Box<dyn RawTag>, TagError> {
        if self.kind != CardKind::Classic1k {
            return Err(TagError::Config(
                "raw block access is only supported for Mifare Classic".into(),
            ));
        }
        Ok(Box::new(MifareTag::new(self.take_card()?)))
    }
}

/// Serializes tag touches: one worker at a time, new arrivals during an
/// operation are dropped with a warning.
pub struct Coordinator {
    controller: Arc<Mutex<TagController>>,
    busy: Arc<AtomicBool>,
}

impl Coordinator {
    pub fn new(controller: Arc<Mutex<TagController>>) -> Coordinator {
        Coordinator {
            controller,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn controller(&self) -> &Arc<Mutex<TagController>> {
        &self.controller
    }

    /// Target-arrival sink. Opens a session for a compatible candidate
    /// and hands it to a fresh worker thread, which invokes the
    /// controller's tag_ready hook exactly once.
    pub fn on_target_detected(&self, targets: Vec<Box<dyn Target>>) {
        let controller = self.controller.lock().expect("controller lock");
        if targets.is_empty() {
            controller.sink().display_alert(
                "Target detected",
                "No target properties available",
                Severity::Warning,
            );
            return;
        }

        // Previous touch still in flight: drop this arrival rather than
        // interleave callbacks.
        if self.busy.swap(true, Ordering::SeqCst) {
            warn!("tag arrived while an operation is in flight, ignoring");
            controller.sink().display_alert(
                "Target detected",
                "Previous operation still running - tag ignored",
                Severity::Warning,
            );
            return;
        }

        let mode = controller.mode();
        let session = match TagSession::open(&targets, mode, MIFARE_RAW_TOKEN) {
            Ok(session) => session,
            Err(err) => {
                controller.sink().display_alert(
                    "Target detected",
                    &format!("Unable to process tag: {err}"),
                    Severity::Error,
                );
                self.busy.store(false, Ordering::SeqCst);
                return;
            }
        };
        drop(controller);

        // Tag processing happens off the callback context.
        let controller = self.controller.clone();
        let busy = self.busy.clone();
        thread::spawn(move || {
            let mut session = session;
            match controller.lock() {
                Ok(mut controller) => controller.tag_ready(&mut session),
                Err(_) => error!("controller lock poisoned, dropping touch"),
            }
            session.close();
            busy.store(false, Ordering::SeqCst);
        });
    }

    #[cfg(test)]
    pub(crate) fn wait_idle(&self) {
        while self.busy.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[cfg(test)]
    pub(crate) fn force_busy(&self) {
        self.busy.store(true, Ordering::SeqCst);
    }
}

/// Blocking NFC service loop: waits for reader state changes, drains
/// controller commands, and reports card arrivals to the coordinator.
pub fn run(
    coordinator: Coordinator,
    tx: Sender<OutgoingMessage>,
    rx: Receiver<NfcCommand>,
) {
    info!("starting NFC discovery loop");

    let ctx = match Context::establish(Scope::User) {
        Ok(ctx) => ctx,
        Err(err) => {
            error!("failed to establish PC/SC context: {err}");
            let _ = tx.send(OutgoingMessage::READER_ERROR {
                error: err.to_string(),
            });
            return;
        }
    };

    let mut readers_buf = [0; 2048];
    let mut reader_names: Vec<CString> = Vec::new();
    let mut reader_states = vec![ReaderState::new(PNP_NOTIFICATION(), State::UNAWARE)];

    loop {
        if let Err(err) = ctx.get_status_change(Duration::from_millis(500), &mut reader_states) {
            if err != pcsc::Error::Timeout {
                error!("PC/SC error: {err}");
                thread::sleep(Duration::from_secs(1));
                continue;
            }
        }

        while let Ok(cmd) = rx.try_recv() {
            match cmd {
                NfcCommand::SetMode(mode) => {
                    let mut controller = coordinator.controller().lock().expect("controller lock");
                    controller.set_mode(mode);
                }
                NfcCommand::SetOperation(op) => {
                    let mut controller = coordinator.controller().lock().expect("controller lock");
                    controller.set_operation(op);
                }
                NfcCommand::CheckReaderStatus => match ctx.list_readers(&mut readers_buf) {
                    Ok(iter) => {
                        reader_names = iter.map(CString::from).collect();
                        let _ = tx.send(OutgoingMessage::READER_STATUS {
                            success: !reader_names.is_empty(),
                        });
                    }
                    Err(_) => {
                        reader_names.clear();
                        let _ = tx.send(OutgoingMessage::READER_STATUS { success: false });
                    }
                },
            }
        }

        let mut readers_changed = false;

        // PnP slot is index 0.
        if reader_states[0].event_state().intersects(State::CHANGED) {
            info!("reader hardware change detected");
            readers_changed = true;
            reader_states[0].sync_current_state();
        }

        for i in 1..reader_states.len() {
            let name = reader_names[i - 1].clone();
            let rs = &reader_states[i];

            if rs.event_state().intersects(State::CHANGED) {
                let current = rs.event_state();

                if current.intersects(State::PRESENT)
                    && !rs.current_state().intersects(State::PRESENT)
                {
                    info!("card inserted on {name:?}");
                    handle_card_insertion(&ctx, &name, &coordinator, &tx);
                }

                if current.intersects(State::EMPTY) && rs.current_state().intersects(State::PRESENT)
                {
                    info!("card removed from {name:?}");
                    let _ = tx.send(OutgoingMessage::CARD_STATUS {
                        success: false,
                        message: "Card removed!".into(),
                    });
                }

                reader_states[i].sync_current_state();
            }
        }

        if readers_changed {
            match ctx.list_readers(&mut readers_buf) {
                Ok(iter) => {
                    reader_names = iter.map(CString::from).collect();
                    // Keep the PnP slot, rebuild the per-reader states.
                    reader_states.truncate(1);
                    for name in &reader_names {
                        reader_states.push(ReaderState::new(name.clone(), State::UNAWARE));
                    }
                    let _ = tx.send(OutgoingMessage::READER_STATUS {
                        success: !reader_names.is_empty(),
                    });
                }
                Err(_) => {
                    reader_names.clear();
                    reader_states.truncate(1);
                    let _ = tx.send(OutgoingMessage::READER_STATUS { success: false });
                }
            }
        }
    }
}

fn handle_card_insertion(
    ctx: &Context,
    reader_name: &CStr,
    coordinator: &Coordinator,
    tx: &Sender<OutgoingMessage>,
) {
    let _ = tx.send(OutgoingMessage::CARD_STATUS {
        success: true,
        message: "Card detected!".into(),
    });

    let card = match ctx.connect(reader_name, ShareMode::Shared, Protocols::ANY) {
        Ok(card) => card,
        Err(err) => {
            error!("failed to connect to card: {err}");
            return;
        }
    };

    let mut names_buf = [0u8; 128];
    let mut atr_buf = [0u8; 64];
    let kind = match card.status2(&mut names_buf, &mut atr_buf) {
        Ok(status) => match status.atr().last() {
            Some(&CARD_TYPE_MIFARE_1K) => CardKind::Classic1k,
            Some(&CARD_TYPE_NTAG) => CardKind::Ntag,
            other => {
                warn!("unrecognized card type byte {other:?}, assuming NTAG");
                CardKind::Ntag
            }
        },
        Err(err) => {
            error!("failed to query card status: {err}");
            return;
        }
    };

    let target: Box<dyn Target> = Box::new(PcscTarget::new(card, kind));
    coordinator.on_target_detected(vec![target]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{InfoSink, TagController};
    use crate::ndef::parse_message;
    use crate::records::uri_record;
    use crate::session::ConnectionMode;
    use crate::session::fakes::FakeTarget;
    use crate::types::TagOperation;

    #[derive(Default)]
    struct RecordingSink {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl InfoSink for RecordingSink {
        fn tag_success(&self, text: &str) {
            self.events.lock().unwrap().push(format!("success: {text}"));
        }

        fn tag_error(&self, text: &str) {
            self.events.lock().unwrap().push(format!("error: {text}"));
        }

        fn display_alert(&self, title: &str, text: &str, _severity: Severity) {
            self.events
                .lock()
                .unwrap()
                .push(format!("alert {title}: {text}"));
        }

        fn log_tag_info(&self, text: &str) {
            self.events.lock().unwrap().push(format!("info: {text}"));
        }
    }

    fn coordinator_with_sink() -> (Coordinator, Arc<Mutex<Vec<String>>>) {
        let sink = RecordingSink::default();
        let events = sink.events.clone();
        let controller = Arc::new(Mutex::new(TagController::new(Box::new(sink))));
        (Coordinator::new(controller), events)
    }

    #[test]
    fn arrival_runs_the_pending_operation_once() {
        let (coordinator, events) = coordinator_with_sink();
        coordinator
            .controller()
            .lock()
            .unwrap()
            .set_operation(TagOperation::WRITE_URI {
                uri: "http://nokia.com/".into(),
            });

        let target = FakeTarget::ndef_target();
        let stored = target.stored.clone();
        coordinator.on_target_detected(vec![Box::new(target)]);
        coordinator.wait_idle();

        let written = stored.lock().unwrap().clone();
        let msg = parse_message(&written).unwrap();
        assert_eq!(msg.records()[0], uri_record("http://nokia.com/").unwrap());
        assert!(events.lock().unwrap().iter().any(|e| e == "success: URI written"));
    }

    #[test]
    fn empty_candidate_list_is_warned_and_dropped() {
        let (coordinator, events) = coordinator_with_sink();
        coordinator.on_target_detected(Vec::new());
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.contains("No target properties available")));
    }

    #[test]
    fn arrival_while_busy_is_dropped_without_opening() {
        let (coordinator, events) = coordinator_with_sink();
        coordinator.force_busy();

        let target = FakeTarget::ndef_target();
        let live = target.live.clone();
        coordinator.on_target_detected(vec![Box::new(target)]);

        assert_eq!(live.load(Ordering::SeqCst), 0);
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.contains("tag ignored")));
    }

    #[test]
    fn incompatible_target_reports_and_resets_busy() {
        let (coordinator, events) = coordinator_with_sink();
        coordinator
            .controller()
            .lock()
            .unwrap()
            .set_mode(ConnectionMode::Raw);

        // NDEF-only fake: in raw mode its connection name won't match
        let target = FakeTarget::raw_target("felica");
        coordinator.on_target_detected(vec![Box::new(target)]);
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.contains("Unable to process tag")));

        // coordinator accepts the next arrival
        coordinator
            .controller()
            .lock()
            .unwrap()
            .set_mode(ConnectionMode::Ndef);
        let target = FakeTarget::ndef_target();
        coordinator.on_target_detected(vec![Box::new(target)]);
        coordinator.wait_idle();
    }

    #[test]
    fn at_most_one_connection_is_ever_live() {
        let (coordinator, _events) = coordinator_with_sink();
        let target = FakeTarget::ndef_target();
        let live = target.live.clone();

        for _ in 0..5 {
            let t = FakeTarget {
                ndef: true,
                name: "fake-ndef".into(),
                stored: target.stored.clone(),
                blocks: target.blocks.clone(),
                key: target.key,
                fail_reads: false,
                live: live.clone(),
            };
            coordinator.on_target_detected(vec![Box::new(t)]);
            assert!(live.load(Ordering::SeqCst) <= 1);
            coordinator.wait_idle();
        }
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }
}
