use anyhow::Context;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message};
use url::Url;

use crate::audio::capture::{FrameSink, SinkError};
use crate::audio::codec::PcmFrame;
use crate::audio::system::AudioConfig;
use crate::config::ServerConfig;

const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub enum NetEvent {
    Text(String),
    Binary(Bytes),
    Connected,
    Disconnected,
}

#[derive(Debug)]
pub enum NetCommand {
    SendBinary(Bytes),
    /// Drop the current connection and dial again
    Reconnect,
}

/// Outbound capture frames go straight onto the command queue.
impl FrameSink for mpsc::Sender<NetCommand> {
    fn try_send_frame(&mut self, frame: PcmFrame) -> Result<(), SinkError> {
        self.try_send(NetCommand::SendBinary(frame.into_bytes()))
            .map_err(|e| match e {
                TrySendError::Full(_) => SinkError::Full,
                TrySendError::Closed(_) => SinkError::Closed,
            })
    }
}

/// Connect URL carrying the session's audio format and server options.
pub fn session_url(server: &ServerConfig, audio: &AudioConfig) -> anyhow::Result<Url> {
    let mut url = Url::parse(&server.url)
        .with_context(|| format!("Invalid server url '{}'", server.url))?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("input_rate", &audio.capture_sample_rate.to_string())
            .append_pair("output_rate", &audio.playback_sample_rate.to_string())
            .append_pair("channels", &audio.channels.to_string());
        if let Some(voice) = &server.voice {
            query.append_pair("voice", voice);
        }
        if let Some(lang) = &server.assistant_lang {
            query.append_pair("assistant_lang", lang);
        }
        if let Some(endpointing) = &server.endpointing {
            query.append_pair("endpointing", endpointing);
        }
    }
    Ok(url)
}

fn next_delay(current: Duration) -> Duration {
    (current * 2).min(MAX_RETRY_DELAY)
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How a healthy connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkExit {
    /// Command queue closed
    Shutdown,
    /// The controller asked for a fresh connection
    Reconnect,
}

pub struct NetLink {
    url: Url,
    tx: mpsc::Sender<NetEvent>,
    rx_cmd: mpsc::Receiver<NetCommand>,
}

impl NetLink {
    pub fn new(url: Url, tx: mpsc::Sender<NetEvent>, rx_cmd: mpsc::Receiver<NetCommand>) -> Self {
        Self { url, tx, rx_cmd }
    }

    /// Keep the connection up until the command queue closes.
    ///
    /// Failed dials and dropped connections are retried with exponential
    /// backoff. The delay resets after a connection the server dropped, but
    /// keeps growing across requested reconnects, so a session that cannot
    /// start is retried ever more slowly.
    pub async fn run(mut self) {
        let mut retry_delay = INITIAL_RETRY_DELAY;
        loop {
            match connect_async(self.url.as_str()).await {
                Ok((ws_stream, _)) => {
                    log::info!("Connected to {}", self.url);
                    match self.pump(ws_stream).await {
                        Ok(LinkExit::Shutdown) => {
                            log::info!("Command queue closed, net link shutting down");
                            break;
                        }
                        Ok(LinkExit::Reconnect) => log::info!("Reconnect requested"),
                        Err(e) => {
                            log::warn!("Connection lost: {:#}", e);
                            retry_delay = INITIAL_RETRY_DELAY;
                        }
                    }
                }
                Err(e) => log::warn!("Failed to connect to {}: {}", self.url, e),
            }

            if self.tx.send(NetEvent::Disconnected).await.is_err() {
                break;
            }
            let stale = self.discard_pending();
            if stale > 0 {
                log::debug!("Discarded {} commands queued for the old connection", stale);
            }

            log::info!("Reconnecting in {}s...", retry_delay.as_secs());
            tokio::time::sleep(retry_delay).await;
            retry_delay = next_delay(retry_delay);
        }
    }

    /// Audio queued for a dead connection belongs to a dead session.
    fn discard_pending(&mut self) -> usize {
        let mut count = 0;
        while self.rx_cmd.try_recv().is_ok() {
            count += 1;
        }
        count
    }

    /// Shuttle frames until either side goes away.
    ///
    /// Connection losses are errors; `Ok` says why a live connection was
    /// given up on purpose.
    async fn pump(&mut self, ws_stream: WsStream) -> anyhow::Result<LinkExit> {
        let (mut write, mut read) = ws_stream.split();
        self.tx.send(NetEvent::Connected).await?;

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            log::debug!("Received Text: {}", text);
                            self.tx.send(NetEvent::Text(text.to_string())).await?;
                        }
                        Some(Ok(Message::Binary(data))) => {
                            self.tx.send(NetEvent::Binary(data)).await?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            log::info!("Server closed connection: {:?}", frame);
                            anyhow::bail!("Connection closed");
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => anyhow::bail!("Connection closed"),
                    }
                }
                cmd = self.rx_cmd.recv() => {
                    match cmd {
                        Some(NetCommand::SendBinary(data)) => {
                            write.send(Message::Binary(data)).await?;
                        }
                        Some(NetCommand::Reconnect) => {
                            // Best effort; the connection is abandoned either way
                            let _ = write.send(Message::Close(None)).await;
                            return Ok(LinkExit::Reconnect);
                        }
                        None => {
                            let _ = write.send(Message::Close(None)).await;
                            return Ok(LinkExit::Shutdown);
                        }
                    }
                }
            }
        }
    }
}
