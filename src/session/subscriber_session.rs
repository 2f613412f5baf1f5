use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

use crate::analysis::PacketRecord;
use crate::broadcast::{BroadcastHub, Subscriber, SubscriberId, ViewerEvent};

const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("WebSocket handshake with {0} failed: {1}")]
    Handshake(SocketAddr, tungstenite::Error),

    #[error("WebSocket handshake with {0} timed out after {1:?}")]
    HandshakeTimeout(SocketAddr, Duration),

    #[error("Write to {0} failed: {1}")]
    Write(SocketAddr, tungstenite::Error),

    #[error("Read from {0} failed: {1}")]
    Read(SocketAddr, tungstenite::Error),

    #[error("Cannot encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

#[derive(Debug)]
pub enum CloseReason {
    ClientClosed,
    /// The hub dropped this subscriber's channel.
    Unregistered,
    Shutdown,
    Failed(SessionError),
}

#[derive(Debug)]
pub struct SessionSummary {
    pub id: Option<SubscriberId>,
    pub peer: SocketAddr,
    pub reason: CloseReason,
    pub records_sent: u64,
    pub final_state: SessionState,
}

/// Bridges one hub subscriber to one WebSocket connection.
pub struct SubscriberSession {
    peer: SocketAddr,
    hub: Arc<BroadcastHub>,
    buffer: usize,
    handshake_timeout: Duration,
    state: SessionState,
    records_sent: u64,
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender counts as a shutdown request.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

impl SubscriberSession {
    pub fn new(peer: SocketAddr, hub: Arc<BroadcastHub>, buffer: usize) -> Self {
        Self {
            peer,
            hub,
            buffer,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            state: SessionState::Connecting,
            records_sent: 0,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        debug!("Viewer {}: {:?} -> {:?}", self.peer, self.state, next);
        self.state = next;
    }

    fn finish(mut self, id: Option<SubscriberId>, reason: CloseReason) -> SessionSummary {
        self.transition(SessionState::Closed);
        SessionSummary {
            id,
            peer: self.peer,
            reason,
            records_sent: self.records_sent,
            final_state: self.state,
        }
    }

    fn handshake_failed(self, error: SessionError) -> SessionSummary {
        debug!("{}", error);
        self.finish(None, CloseReason::Failed(error))
    }

    /// Runs the session to completion. Never returns an error: every failure
    /// ends up in the summary's close reason.
    pub async fn run<S>(mut self, stream: S, mut shutdown: watch::Receiver<bool>) -> SessionSummary
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let ws = tokio::select! {
            result = tokio::time::timeout(self.handshake_timeout, tokio_tungstenite::accept_async(stream)) => match result {
                Ok(Ok(ws)) => ws,
                Ok(Err(e)) => {
                    let error = SessionError::Handshake(self.peer, e);
                    return self.handshake_failed(error);
                },
                Err(_) => {
                    let error = SessionError::HandshakeTimeout(self.peer, self.handshake_timeout);
                    return self.handshake_failed(error);
                },
            },
            _ = shutdown_requested(&mut shutdown) => return self.finish(None, CloseReason::Shutdown),
        };

        let (subscriber, mut outbound) = Subscriber::channel(self.buffer);
        let id = self.hub.register(subscriber);
        self.transition(SessionState::Active);
        info!("Viewer {} connected as {}", self.peer, id);

        let (mut sink, mut incoming) = ws.split();

        let reason = loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break CloseReason::Shutdown,
                next = outbound.recv() => match next {
                    Some(record) => {
                        if let Err(e) = self.forward(&mut sink, &record).await {
                            break CloseReason::Failed(e);
                        }
                    },
                    None => break CloseReason::Unregistered,
                },
                frame = incoming.next() => match frame {
                    Some(Ok(Message::Close(_))) | None => break CloseReason::ClientClosed,
                    // Viewers have nothing to say; pings are answered by tungstenite.
                    Some(Ok(_)) => {},
                    Some(Err(e)) => break CloseReason::Failed(SessionError::Read(self.peer, e)),
                },
            }
        };

        self.transition(SessionState::Closing);
        self.hub.unregister(id);

        match &reason {
            CloseReason::Failed(error) => warn!("Viewer {} ({}) dropped: {}", self.peer, id, error),
            other => info!("Viewer {} ({}) closed: {:?}, {} records sent", self.peer, id, other, self.records_sent),
        }

        if !matches!(reason, CloseReason::Failed(_)) {
            match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
                Ok(Err(e)) => debug!("Close handshake with {} failed: {}", self.peer, e),
                Err(_) => debug!("Close handshake with {} timed out", self.peer),
                Ok(Ok(())) => {},
            }
        }
        drop(sink);
        drop(incoming);

        self.finish(Some(id), reason)
    }

    async fn forward<S>(
        &mut self,
        sink: &mut futures_util::stream::SplitSink<WebSocketStream<S>, Message>,
        record: &PacketRecord,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let text = ViewerEvent::packet(record).to_json()?;
        sink.send(Message::Text(text))
            .await
            .map_err(|e| SessionError::Write(self.peer, e))?;
        self.records_sent += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::TransportProtocol;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    const LAST_RECORD: usize = 1_000_000;

    fn sample(size: usize) -> PacketRecord {
        PacketRecord::new("10.1.1.1".to_string(), "10.1.1.2".to_string(), TransportProtocol::Tcp, size)
    }

    async fn wait_for_subscribers(hub: &BroadcastHub, count: usize) {
        for _ in 0..500 {
            if hub.subscriber_count() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} subscribers, have {}", count, hub.subscriber_count());
    }

    async fn start_session(
        hub: Arc<BroadcastHub>,
        shutdown: watch::Receiver<bool>,
    ) -> (SocketAddr, JoinHandle<SessionSummary>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            SubscriberSession::new(peer, hub, 16).run(stream, shutdown).await
        });
        (addr, handle)
    }

    // Accepts any number of viewers, handing back each session's task in accept order.
    async fn start_sessions(
        hub: Arc<BroadcastHub>,
        shutdown: watch::Receiver<bool>,
        buffer: usize,
    ) -> (SocketAddr, mpsc::UnboundedReceiver<JoinHandle<SessionSummary>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (handles_tx, handles_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                let session = SubscriberSession::new(peer, Arc::clone(&hub), buffer);
                let handle = tokio::spawn(session.run(stream, shutdown.clone()));
                if handles_tx.send(handle).is_err() {
                    break;
                }
            }
        });
        (addr, handles_rx)
    }

    #[test]
    fn test_new_session_is_connecting() {
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let session = SubscriberSession::new(peer, Arc::new(BroadcastHub::new()), 4);
        assert_eq!(session.state(), SessionState::Connecting);
    }

    #[tokio::test]
    async fn test_forwards_records_in_order() {
        let hub = Arc::new(BroadcastHub::new());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (addr, handle) = start_session(Arc::clone(&hub), shutdown_rx).await;

        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr)).await.unwrap();
        wait_for_subscribers(&hub, 1).await;

        for size in [60, 61, 62] {
            hub.publish(sample(size));
        }

        for expected in [60, 61, 62] {
            let message = client.next().await.unwrap().unwrap();
            let text = match message {
                Message::Text(text) => text,
                other => panic!("unexpected frame {:?}", other),
            };
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            assert_eq!(value["event"], "packet_data");
            assert_eq!(value["data"]["size"], expected);
            assert_eq!(value["data"]["protocol"], "TCP");
        }

        client.close(None).await.unwrap();
        let summary = handle.await.unwrap();
        assert!(matches!(summary.reason, CloseReason::ClientClosed));
        assert_eq!(summary.final_state, SessionState::Closed);
        assert_eq!(summary.records_sent, 3);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_session() {
        let hub = Arc::new(BroadcastHub::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (addr, handle) = start_session(Arc::clone(&hub), shutdown_rx).await;

        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr)).await.unwrap();
        wait_for_subscribers(&hub, 1).await;

        shutdown_tx.send(true).unwrap();
        let summary = handle.await.unwrap();
        assert!(matches!(summary.reason, CloseReason::Shutdown));
        assert_eq!(summary.final_state, SessionState::Closed);
        assert_eq!(hub.subscriber_count(), 0);

        loop {
            match client.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_unregister_ends_session() {
        let hub = Arc::new(BroadcastHub::new());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (addr, handle) = start_session(Arc::clone(&hub), shutdown_rx).await;

        let (_client, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr)).await.unwrap();
        wait_for_subscribers(&hub, 1).await;

        assert_eq!(hub.unregister_all(), 1);
        let summary = handle.await.unwrap();
        assert!(matches!(summary.reason, CloseReason::Unregistered));
        assert!(summary.id.is_some());
    }

    #[tokio::test]
    async fn test_failed_handshake_never_registers() {
        let hub = Arc::new(BroadcastHub::new());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (addr, handle) = start_session(Arc::clone(&hub), shutdown_rx).await;

        let mut raw = TcpStream::connect(addr).await.unwrap();
        raw.write_all(b"GET / HTTP/1.1\r\nHost: nowhere\r\n\r\n").await.unwrap();
        drop(raw);

        let summary = handle.await.unwrap();
        assert!(matches!(summary.reason, CloseReason::Failed(SessionError::Handshake(_, _))));
        assert!(summary.id.is_none());
        assert_eq!(summary.final_state, SessionState::Closed);
        assert_eq!(hub.stats().subscribers, 0);
    }

    #[tokio::test]
    async fn test_silent_client_times_out_in_handshake() {
        let hub = Arc::new(BroadcastHub::new());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move {
                let (stream, peer) = listener.accept().await.unwrap();
                SubscriberSession::new(peer, hub, 16)
                    .with_handshake_timeout(Duration::from_millis(100))
                    .run(stream, shutdown_rx)
                    .await
            })
        };

        let _silent = TcpStream::connect(addr).await.unwrap();

        let summary = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(matches!(summary.reason, CloseReason::Failed(SessionError::HandshakeTimeout(_, _))));
        assert!(summary.id.is_none());
        assert_eq!(summary.final_state, SessionState::Closed);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_reset_viewer_leaves_other_viewers_untouched() {
        let hub = Arc::new(BroadcastHub::new());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (addr, mut handles) = start_sessions(Arc::clone(&hub), shutdown_rx, 1024).await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let (doomed, _) = tokio_tungstenite::client_async(format!("ws://{}", addr), stream).await.unwrap();
        let doomed_session = handles.recv().await.unwrap();
        wait_for_subscribers(&hub, 1).await;

        let (mut survivor, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr)).await.unwrap();
        let _survivor_session = handles.recv().await.unwrap();
        wait_for_subscribers(&hub, 2).await;

        let collector = tokio::spawn(async move {
            let mut sizes = Vec::new();
            while let Some(Ok(message)) = survivor.next().await {
                if let Message::Text(text) = message {
                    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                    let size = value["data"]["size"].as_u64().unwrap() as usize;
                    if size == LAST_RECORD {
                        break;
                    }
                    sizes.push(size);
                }
            }
            sizes
        });

        // Zero linger turns the close into a TCP reset.
        #[allow(deprecated)]
        doomed.get_ref().set_linger(Some(Duration::ZERO)).unwrap();
        drop(doomed);

        let mut published = 0;
        while !doomed_session.is_finished() && published < 2_000 {
            hub.publish(sample(published));
            published += 1;
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let summary = tokio::time::timeout(Duration::from_secs(5), doomed_session).await.unwrap().unwrap();
        assert!(matches!(
            summary.reason,
            CloseReason::Failed(SessionError::Write(_, _))
                | CloseReason::Failed(SessionError::Read(_, _))
                | CloseReason::ClientClosed
        ));
        assert_eq!(summary.final_state, SessionState::Closed);
        assert_eq!(hub.subscriber_count(), 1);

        hub.publish(sample(LAST_RECORD));
        let sizes = tokio::time::timeout(Duration::from_secs(5), collector).await.unwrap().unwrap();
        assert_eq!(sizes, (0..published).collect::<Vec<_>>());
    }
}
