//! Signalling client interface and a reference WebSocket implementation.
//!
//! The core channel state machine only depends on [`SignallingTransport`].
//! [`WebSocketSignalling`] is a concrete, intentionally thin implementation
//! over [`crate::ws`], so the CLI binary and integration tests have
//! something real to negotiate against.

use crate::envelope::Envelope;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::{broadcast, Notify};

/// Contract the channel state machine uses to exchange negotiation messages
/// before stability.
///
/// Implementations MUST queue `send` calls issued while `is_open() == false`
/// and flush them in order on open, and MUST deliver inbound envelopes
/// exactly once in arrival order.
#[async_trait]
pub trait SignallingTransport: Send + Sync {
    /// `true` once the transport is connected and flushing sends directly.
    fn is_open(&self) -> bool;

    /// Connect the transport. Queued sends are flushed, in order, once open.
    async fn connect(&self) -> anyhow::Result<()>;

    /// Disconnect the transport. Safe to call when already disconnected.
    async fn disconnect(&self);

    /// Send (or queue, if not yet open) an envelope.
    async fn send(&self, envelope: &Envelope) -> anyhow::Result<()>;

    /// Subscribe to inbound envelopes, delivered exactly once each in
    /// arrival order to every subscriber.
    fn subscribe(&self) -> broadcast::Receiver<Envelope>;

    /// Resolves once the transport has opened (or immediately, if already
    /// open).
    async fn wait_open(&self);
}

/// A reference [`SignallingTransport`] over `tokio-tungstenite`, speaking one
/// JSON envelope per text frame per the wire format in §6.
pub struct WebSocketSignalling {
    url: String,
    open: std::sync::atomic::AtomicBool,
    pending: Mutex<VecDeque<Envelope>>,
    writer: Mutex<Option<crate::ws::WsWriter>>,
    inbound_tx: broadcast::Sender<Envelope>,
    opened: Notify,
    reader_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for WebSocketSignalling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketSignalling").field("url", &self.url).finish_non_exhaustive()
    }
}

impl WebSocketSignalling {
    /// Build a signalling transport that will connect to `url` on demand.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        let (inbound_tx, _) = broadcast::channel(64);
        Self {
            url: url.into(),
            open: std::sync::atomic::AtomicBool::new(false),
            pending: Mutex::new(VecDeque::new()),
            writer: Mutex::new(None),
            inbound_tx,
            opened: Notify::new(),
            reader_task: Mutex::new(None),
        }
    }

    async fn flush_pending(&self) {
        let drained: Vec<Envelope> = {
            let mut pending = self.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            pending.drain(..).collect()
        };
        for envelope in drained {
            let _ = self.send_now(&envelope).await;
        }
    }

    async fn send_now(&self, envelope: &Envelope) -> anyhow::Result<()> {
        let text = envelope.serialize().map_err(|e| anyhow::anyhow!(e))?;
        let mut writer = self.writer.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match writer.as_mut() {
            Some(w) => w.send_text(&text).await,
            None => anyhow::bail!("signalling transport not connected"),
        }
    }
}

#[async_trait]
impl SignallingTransport for WebSocketSignalling {
    fn is_open(&self) -> bool {
        self.open.load(std::sync::atomic::Ordering::SeqCst)
    }

    async fn connect(&self) -> anyhow::Result<()> {
        let url = crate::ws::http_to_ws_scheme(&self.url);
        let (writer, mut reader) = crate::ws::connect(&url, &[]).await?;

        *self.writer.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(writer);
        self.open.store(true, std::sync::atomic::Ordering::SeqCst);
        self.opened.notify_waiters();

        let inbound_tx = self.inbound_tx.clone();
        let handle = tokio::spawn(async move {
            while let Some(msg) = reader.recv().await {
                let Ok(crate::ws::WsMessage::Text(text)) = msg else { continue };
                match Envelope::deserialize(&text) {
                    Ok(envelope) => {
                        let _ = inbound_tx.send(envelope);
                    }
                    Err(e) => log::debug!("ignoring non-envelope signalling frame: {e}"),
                }
            }
        });
        *self.reader_task.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handle);

        self.flush_pending().await;
        Ok(())
    }

    async fn disconnect(&self) {
        self.open.store(false, std::sync::atomic::Ordering::SeqCst);
        if let Some(mut writer) = self.writer.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take() {
            let _ = writer.close().await;
        }
        if let Some(handle) = self.reader_task.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take() {
            handle.abort();
        }
    }

    async fn send(&self, envelope: &Envelope) -> anyhow::Result<()> {
        if self.is_open() {
            self.send_now(envelope).await
        } else {
            self.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push_back(envelope.clone());
            Ok(())
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.inbound_tx.subscribe()
    }

    async fn wait_open(&self) {
        if self.is_open() {
            return;
        }
        self.opened.notified().await;
    }
}

/// An in-process [`SignallingTransport`] pair, for tests that exercise the
/// channel state machine without a real WebSocket server.
pub struct LoopbackSignalling {
    open: std::sync::atomic::AtomicBool,
    pending: Mutex<VecDeque<Envelope>>,
    peer_tx: Mutex<Option<broadcast::Sender<Envelope>>>,
    inbound_tx: broadcast::Sender<Envelope>,
    opened: Notify,
}

impl std::fmt::Debug for LoopbackSignalling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackSignalling").finish_non_exhaustive()
    }
}

impl LoopbackSignalling {
    /// Build a connected pair of loopback transports.
    #[must_use]
    pub fn pair() -> (std::sync::Arc<Self>, std::sync::Arc<Self>) {
        let (a_tx, _) = broadcast::channel(64);
        let (b_tx, _) = broadcast::channel(64);
        let a = std::sync::Arc::new(Self {
            open: std::sync::atomic::AtomicBool::new(false),
            pending: Mutex::new(VecDeque::new()),
            peer_tx: Mutex::new(Some(b_tx.clone())),
            inbound_tx: a_tx.clone(),
            opened: Notify::new(),
        });
        let b = std::sync::Arc::new(Self {
            open: std::sync::atomic::AtomicBool::new(false),
            pending: Mutex::new(VecDeque::new()),
            peer_tx: Mutex::new(Some(a_tx)),
            inbound_tx: b_tx,
            opened: Notify::new(),
        });
        (a, b)
    }
}

#[async_trait]
impl SignallingTransport for LoopbackSignalling {
    fn is_open(&self) -> bool {
        self.open.load(std::sync::atomic::Ordering::SeqCst)
    }

    async fn connect(&self) -> anyhow::Result<()> {
        self.open.store(true, std::sync::atomic::Ordering::SeqCst);
        self.opened.notify_waiters();
        let drained: Vec<Envelope> = {
            let mut pending = self.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            pending.drain(..).collect()
        };
        for envelope in drained {
            self.send(&envelope).await?;
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.open.store(false, std::sync::atomic::Ordering::SeqCst);
    }

    async fn send(&self, envelope: &Envelope) -> anyhow::Result<()> {
        if !self.is_open() {
            self.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push_back(envelope.clone());
            return Ok(());
        }
        let peer_tx = self.peer_tx.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone();
        if let Some(tx) = peer_tx {
            let _ = tx.send(envelope.clone());
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.inbound_tx.subscribe()
    }

    async fn wait_open(&self) {
        if self.is_open() {
            return;
        }
        self.opened.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Message, Party};

    fn sample() -> Envelope {
        Envelope {
            timestamp: 0,
            max_age: 60,
            priority: 0,
            sequence: 0,
            sender: Party { account: "node".to_string(), signer: "a".repeat(40) },
            receiver: Party { account: "node".to_string(), signer: "b".repeat(40) },
            payload: Message::Rejection {},
            signature: "sig".to_string(),
        }
    }

    #[tokio::test]
    async fn test_loopback_queues_while_closed_then_flushes_on_open() {
        let (a, b) = LoopbackSignalling::pair();
        let mut b_rx = b.subscribe();

        a.send(&sample()).await.unwrap();
        assert!(!a.is_open());

        a.connect().await.unwrap();
        b.connect().await.unwrap();

        let received = b_rx.recv().await.unwrap();
        assert_eq!(received, sample());
    }

    #[tokio::test]
    async fn test_loopback_delivers_in_order() {
        let (a, b) = LoopbackSignalling::pair();
        a.connect().await.unwrap();
        b.connect().await.unwrap();
        let mut b_rx = b.subscribe();

        for i in 0..3 {
            let mut e = sample();
            e.sequence = i;
            a.send(&e).await.unwrap();
        }

        for i in 0..3 {
            assert_eq!(b_rx.recv().await.unwrap().sequence, i);
        }
    }
}
