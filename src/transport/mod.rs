//! # Transport session
//!
//! Owns the single TCP connection to the radio (spec §4.1, I1). The
//! wire framing is the same length-prefixed header the template's
//! serial reader recognized (`0x94 0xC3 len_hi len_lo`), but unlike the
//! template's fallback-heavy serial reader, this reader never attempts
//! to hand-decode the payload — it hands the whole frame to the caller
//! as opaque bytes and lets the codec (`crate::protobuf`) do the actual
//! parsing. Runs as its own task so the dispatcher (`crate::manager`)
//! only ever consumes whole frames off a channel, matching §5's "reader
//! task, driven by socket readability, delivering decoded frames in
//! arrival order."

use std::time::Duration;

use bytes::Bytes;
use log::{debug, error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;

const FRAME_MAGIC: [u8; 2] = [0x94, 0xC3];
const MAX_FRAME_LEN: usize = 1 << 16;
const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

/// Events surfaced to the dispatcher. One `Message` per whole inbound frame.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    Message(Bytes),
    Disconnected,
    Error(String),
}

enum Control {
    Send(Bytes),
    Disconnect,
    SetStaleTimeout(Duration),
}

/// Caller-facing handle. Cloning it cheaply shares the same underlying
/// session (it's just channel senders) — only one task ever owns the
/// socket itself.
#[derive(Clone)]
pub struct TransportHandle {
    control_tx: mpsc::Sender<Control>,
}

impl TransportHandle {
    /// Transmit one already-encoded outbound frame's payload. The
    /// length-prefix header is added by the writer task.
    pub async fn send(&self, payload: Bytes) -> anyhow::Result<()> {
        self.control_tx
            .send(Control::Send(payload))
            .await
            .map_err(|_| anyhow::anyhow!("transport task has shut down"))
    }

    /// Idempotent: a second call while already disconnected is a no-op
    /// from the caller's perspective (the channel send just succeeds).
    pub async fn disconnect(&self) {
        let _ = self.control_tx.send(Control::Disconnect).await;
    }

    pub async fn set_stale_timeout(&self, timeout: Duration) {
        let _ = self.control_tx.send(Control::SetStaleTimeout(timeout)).await;
    }
}

/// Connect to `host:port` and spawn the reader/writer/watchdog task.
/// Returns immediately; the first [`TransportEvent::Connected`] (or
/// `Error`) arrives asynchronously on the returned receiver.
pub fn connect(
    host: String,
    port: u16,
    stale_timeout: Duration,
) -> (TransportHandle, mpsc::Receiver<TransportEvent>) {
    let (event_tx, event_rx) = mpsc::channel(256);
    let (control_tx, control_rx) = mpsc::channel(64);

    tokio::spawn(session_task(host, port, stale_timeout, event_tx, control_rx));

    (TransportHandle { control_tx }, event_rx)
}

async fn session_task(
    host: String,
    port: u16,
    mut stale_timeout: Duration,
    event_tx: mpsc::Sender<TransportEvent>,
    mut control_rx: mpsc::Receiver<Control>,
) {
    let mut user_disconnected = false;

    'reconnect: loop {
        if user_disconnected {
            return;
        }

        info!("connecting to {}:{}", host, port);
        let stream = match TcpStream::connect((host.as_str(), port)).await {
            Ok(s) => s,
            Err(e) => {
                warn!("connect to {}:{} failed: {}", host, port, e);
                let _ = event_tx.send(TransportEvent::Error(e.to_string())).await;
                tokio::time::sleep(RECONNECT_BACKOFF).await;
                continue 'reconnect;
            }
        };
        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = stream.into_split();
        if event_tx.send(TransportEvent::Connected).await.is_err() {
            return;
        }

        let mut rx_buf: Vec<u8> = Vec::with_capacity(1024);
        let mut read_chunk = [0u8; 4096];
        let mut last_frame_at = Instant::now();

        loop {
            let stale_deadline = last_frame_at + stale_timeout;
            tokio::select! {
                biased;

                control = control_rx.recv() => {
                    match control {
                        Some(Control::Disconnect) => {
                            user_disconnected = true;
                            info!("user-initiated disconnect");
                            let _ = event_tx.send(TransportEvent::Disconnected).await;
                            return;
                        }
                        Some(Control::SetStaleTimeout(d)) => {
                            stale_timeout = d;
                        }
                        Some(Control::Send(payload)) => {
                            if let Err(e) = write_frame(&mut writer, &payload).await {
                                error!("send failed: {}", e);
                                let _ = event_tx.send(TransportEvent::Error(e.to_string())).await;
                            }
                        }
                        None => {
                            // Every handle dropped; tear down the session.
                            return;
                        }
                    }
                }

                result = reader.read(&mut read_chunk) => {
                    match result {
                        Ok(0) => {
                            warn!("transport read EOF, connection closed by peer");
                            break;
                        }
                        Ok(n) => {
                            rx_buf.extend_from_slice(&read_chunk[..n]);
                            while let Some(frame) = extract_frame(&mut rx_buf) {
                                last_frame_at = Instant::now();
                                debug!("inbound frame, {} bytes", frame.len());
                                if event_tx.send(TransportEvent::Message(Bytes::from(frame))).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            error!("transport read error: {}", e);
                            let _ = event_tx.send(TransportEvent::Error(e.to_string())).await;
                            break;
                        }
                    }
                }

                _ = tokio::time::sleep_until(stale_deadline) => {
                    warn!("stale connection watchdog fired after {:?}, disconnecting", stale_timeout);
                    break;
                }
            }
        }

        let _ = event_tx.send(TransportEvent::Disconnected).await;
        if user_disconnected {
            return;
        }
        tokio::time::sleep(RECONNECT_BACKOFF).await;
    }
}

/// Pull one whole frame out of the accumulation buffer if present,
/// realigning to the next magic header on garbage (same recovery the
/// template's serial reader used, minus the protobuf-sniffing it did
/// beyond framing).
fn extract_frame(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    loop {
        if buf.len() < 4 {
            return None;
        }
        if buf[0] != FRAME_MAGIC[0] || buf[1] != FRAME_MAGIC[1] {
            match buf.iter().position(|&b| b == FRAME_MAGIC[0]) {
                Some(0) => unreachable!("checked above"),
                Some(pos) => {
                    buf.drain(0..pos);
                    continue;
                }
                None => {
                    buf.clear();
                    return None;
                }
            }
        }

        let declared = ((buf[2] as usize) << 8) | (buf[3] as usize);
        if declared == 0 || declared > MAX_FRAME_LEN {
            buf.drain(0..1);
            continue;
        }
        if buf.len() < 4 + declared {
            return None;
        }
        let frame: Vec<u8> = buf[4..4 + declared].to_vec();
        buf.drain(0..4 + declared);
        return Some(frame);
    }
}

async fn write_frame(
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    payload: &[u8],
) -> anyhow::Result<()> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(anyhow::anyhow!("outbound frame too large: {} bytes", payload.len()));
    }
    let mut header = [0u8; 4];
    header[0] = FRAME_MAGIC[0];
    header[1] = FRAME_MAGIC[1];
    header[2] = ((payload.len() >> 8) & 0xFF) as u8;
    header[3] = (payload.len() & 0xFF) as u8;
    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_frame_returns_none_on_partial_header() {
        let mut buf = vec![0x94, 0xC3, 0x00];
        assert!(extract_frame(&mut buf).is_none());
    }

    #[test]
    fn extract_frame_realigns_past_garbage_bytes() {
        let mut buf = vec![0xFF, 0xFF, 0x94, 0xC3, 0x00, 0x02, 0xAB, 0xCD];
        let frame = extract_frame(&mut buf).expect("frame should be extracted");
        assert_eq!(frame, vec![0xAB, 0xCD]);
        assert!(buf.is_empty());
    }

    #[test]
    fn extract_frame_waits_for_full_declared_length() {
        let mut buf = vec![0x94, 0xC3, 0x00, 0x04, 0x01, 0x02];
        assert!(extract_frame(&mut buf).is_none());
        buf.extend_from_slice(&[0x03, 0x04]);
        let frame = extract_frame(&mut buf).unwrap();
        assert_eq!(frame, vec![1, 2, 3, 4]);
    }

    #[test]
    fn extract_frame_skips_unreasonable_declared_length() {
        let mut buf = vec![0x94, 0xC3, 0xFF, 0xFF, 0x94, 0xC3, 0x00, 0x01, 0x42];
        let frame = extract_frame(&mut buf).expect("should recover at next header");
        assert_eq!(frame, vec![0x42]);
    }
}
