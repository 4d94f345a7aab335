use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::audio::scheduler::OutputDevice;
use crate::audio::system::{AudioConfig, AudioSystem, DeviceEvent, DeviceEventKind};
use crate::error::Result;
use crate::net_link::{NetCommand, NetEvent};
use crate::protocol::{ServerEvent, parse_event};
use crate::session::{Session, SessionConfig};

/// Acquires the output device (and whatever feeds capture) for a new session.
pub trait AudioBackend {
    type Device: OutputDevice;

    /// Device threads report through `events`, tagged with `session`.
    fn open(&mut self, session: Uuid, events: mpsc::Sender<DeviceEvent>) -> Result<Self::Device>;
}

/// Opens an `AudioSystem` per session.
pub struct SystemBackend {
    config: AudioConfig,
}

impl SystemBackend {
    pub fn new(config: AudioConfig) -> Self {
        Self { config }
    }
}

impl AudioBackend for SystemBackend {
    type Device = AudioSystem;

    fn open(&mut self, session: Uuid, events: mpsc::Sender<DeviceEvent>) -> Result<AudioSystem> {
        AudioSystem::start(&self.config, session, events)
    }
}

/// Routes network and device events into the current session.
///
/// A session lives exactly as long as one connection. All of its state is
/// touched only from here, on the controller's event loop.
pub struct CoreController<B: AudioBackend> {
    backend: B,
    session_config: SessionConfig,
    session: Option<Session<B::Device>>,
    net_tx: mpsc::Sender<NetCommand>,
    device_tx: mpsc::Sender<DeviceEvent>,
}

impl<B: AudioBackend> CoreController<B> {
    pub fn new(
        backend: B,
        session_config: SessionConfig,
        net_tx: mpsc::Sender<NetCommand>,
        device_tx: mpsc::Sender<DeviceEvent>,
    ) -> Self {
        Self {
            backend,
            session_config,
            session: None,
            net_tx,
            device_tx,
        }
    }

    pub fn session(&self) -> Option<&Session<B::Device>> {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut Session<B::Device>> {
        self.session.as_mut()
    }

    pub async fn handle_net_event(&mut self, event: NetEvent) {
        match event {
            NetEvent::Connected => self.open_session(),
            NetEvent::Disconnected => {
                if self.close_session() {
                    log::info!("WebSocket Disconnected");
                }
            }
            NetEvent::Binary(data) => self.process_server_audio(data),
            NetEvent::Text(text) => self.process_server_text(&text),
        }
    }

    fn open_session(&mut self) {
        // A connection never shares a session with the one before it
        self.close_session();

        let id = Uuid::new_v4();
        match self.backend.open(id, self.device_tx.clone()) {
            Ok(device) => {
                self.session = Some(Session::new(id, &self.session_config, device));
            }
            Err(e) => {
                log::error!("Cannot start session: {}", e);
                self.request_reconnect();
            }
        }
    }

    /// Ask the link to redial so a fresh session is built; its backoff
    /// paces the retries. Never waits on the command queue.
    fn request_reconnect(&self) {
        match self.net_tx.try_send(NetCommand::Reconnect) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log::warn!("Command queue full, reconnect request dropped")
            }
            Err(TrySendError::Closed(_)) => log::debug!("Net link gone, not reconnecting"),
        }
    }

    /// Returns true if there was a session to close.
    fn close_session(&mut self) -> bool {
        match self.session.take() {
            Some(mut session) => {
                session.teardown();
                true
            }
            None => false,
        }
    }

    fn process_server_audio(&mut self, data: Bytes) {
        let Some(session) = self.session.as_mut() else {
            log::debug!("Dropping {} bytes of audio: no session", data.len());
            return;
        };
        match session.on_inbound_audio(data) {
            Ok(scheduled) => {
                for block in scheduled.iter().filter(|b| b.starvation.is_some()) {
                    log::debug!("Block {} resynced after starvation", block.seq);
                }
            }
            Err(e) => log::warn!("Dropping inbound audio: {}", e),
        }
    }

    fn process_server_text(&mut self, text: &str) {
        let event = match parse_event(text) {
            Ok(event) => event,
            Err(e) => {
                log::debug!("Ignoring server text ({}): {}", e, text);
                return;
            }
        };

        match event {
            ServerEvent::ChatInit { chat_id } => match self.session.as_mut() {
                Some(session) => session.set_chat_id(chat_id),
                None => log::warn!("Chat {} started with no audio session", chat_id),
            },
            ServerEvent::UserTranscript(transcript) => {
                log::info!("User: {}", transcript);
                if let Some(session) = self.session.as_mut() {
                    session.on_transcript(&transcript);
                }
            }
            ServerEvent::TextOutput { content, is_final } => {
                if is_final {
                    log::info!("Assistant: {}", content);
                } else {
                    log::debug!("Assistant (partial): {}", content);
                }
            }
            ServerEvent::AssistantFinal(_) => log::debug!("Assistant turn finished"),
            ServerEvent::StatusUpdate(status) => log::info!("Status: {}", status),
            ServerEvent::ToolEvent { name, status } => {
                log::info!("Tool {}: {}", name, status.as_deref().unwrap_or("-"))
            }
        }
    }

    pub async fn handle_device_event(&mut self, event: DeviceEvent) {
        let current = self.session.as_ref().map(|s| s.id());
        if current != Some(event.session) {
            log::debug!(
                "Discarding {} from stale session {}",
                event.kind.label(),
                event.session
            );
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };

        match event.kind {
            DeviceEventKind::Captured(block) => {
                session.on_captured(&block, &mut self.net_tx);
            }
            DeviceEventKind::Completed(handle) => {
                session.on_block_complete(handle);
            }
            DeviceEventKind::Fault(msg) => {
                log::error!("Audio device failed: {}. Restarting session.", msg);
                self.close_session();
                self.request_reconnect();
            }
        }
    }

    pub fn shutdown(&mut self) {
        self.close_session();
    }
}
