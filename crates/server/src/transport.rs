use crate::hub::registry::SessionEntry;
use crate::hub::{Hub, HubState};
use convo_proto::chat::SessionHello;
use convo_proto::{CodecError, ControlEnvelope, Frame, FrameType};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, info, warn};

static CONNECTION_SEQ: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
pub enum ConnectionError {
    Handshake,
    HelloTimeout,
    HelloRejected,
    Closed,
}

impl Display for ConnectionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Handshake => write!(f, "websocket handshake failed"),
            Self::HelloTimeout => write!(f, "hello frame did not arrive in time"),
            Self::HelloRejected => write!(f, "hello frame rejected"),
            Self::Closed => write!(f, "connection closed before hello"),
        }
    }
}

impl Error for ConnectionError {}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Accept loop: one spawned task per connection, identified by a
/// process-wide connection id.
pub async fn serve(state: Arc<HubState>) -> std::io::Result<()> {
    let listener = TcpListener::bind(&state.config.bind).await?;
    info!(bind = %state.config.bind, "hub listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let connection_id = CONNECTION_SEQ.fetch_add(1, Ordering::SeqCst);
            if let Err(err) = handle_connection(state, stream, connection_id).await {
                debug!(connection = connection_id, peer = %peer, error = %err, "connection rejected");
            }
        });
    }
}

/// Pulls the next decodable frame off the socket. Control messages
/// are handled transparently; `None` means the peer is gone.
async fn next_frame(source: &mut WsSource) -> Option<Result<Frame, CodecError>> {
    while let Some(message) = source.next().await {
        match message {
            Ok(Message::Binary(bytes)) => {
                return Some(Frame::decode(&bytes).map(|(frame, _)| frame));
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => return None,
            Ok(_) => {
                debug!("non-binary websocket message ignored");
            }
            Err(_) => return None,
        }
    }
    None
}

async fn handle_connection(
    state: Arc<HubState>,
    stream: TcpStream,
    connection_id: u64,
) -> Result<(), ConnectionError> {
    let websocket = accept_async(stream)
        .await
        .map_err(|_| ConnectionError::Handshake)?;
    let (mut sink, mut source) = websocket.split();

    // A connection is anonymous until its hello frame arrives; it
    // receives nothing and routes nothing before that.
    let hello_deadline = Duration::from_secs(state.config.hello_timeout_secs.max(1));
    let hello = match timeout(hello_deadline, next_frame(&mut source)).await {
        Ok(Some(Ok(frame))) => frame,
        Ok(Some(Err(err))) => {
            warn!(connection = connection_id, error = %err, "undecodable hello");
            reject_handshake(&mut sink, "malformed-frame").await;
            return Err(ConnectionError::HelloRejected);
        }
        Ok(None) => return Err(ConnectionError::Closed),
        Err(_) => {
            let _ = sink.close().await;
            return Err(ConnectionError::HelloTimeout);
        }
    };
    if hello.frame_type != FrameType::Hello {
        reject_handshake(&mut sink, "malformed-frame").await;
        return Err(ConnectionError::HelloRejected);
    }
    let hello = match SessionHello::try_from(&hello.payload) {
        Ok(hello) if !hello.user_id.is_empty() => hello,
        _ => {
            reject_handshake(&mut sink, "malformed-frame").await;
            return Err(ConnectionError::HelloRejected);
        }
    };
    if let Err(err) = state.directory.resolve_user(&hello.user_id).await {
        warn!(connection = connection_id, user = %hello.user_id, error = %err, "unknown user in hello");
        reject_handshake(&mut sink, "unknown-user").await;
        return Err(ConnectionError::HelloRejected);
    }

    let hub = Hub::new(Arc::clone(&state));
    let (sender, receiver) = mpsc::channel::<Frame>(state.config.session_buffer);
    let entry = match hub.connect(&hello.user_id, connection_id, sender).await {
        Ok(entry) => entry,
        Err(err) => {
            reject_handshake(&mut sink, err.code()).await;
            return Err(ConnectionError::HelloRejected);
        }
    };

    let keepalive = Duration::from_secs(state.config.keepalive_secs.max(1));
    let writer = tokio::spawn(write_loop(sink, receiver, keepalive));

    read_loop(&state, &hub, &entry, &mut source).await;

    hub.disconnect(&entry.session_id).await;
    drop(entry);
    let _ = writer.await;
    Ok(())
}

/// Inbound half: frames are handled strictly in arrival order, which
/// is what carries a sender's ordering through to the fan-out queues.
async fn read_loop(
    state: &Arc<HubState>,
    hub: &Hub,
    entry: &Arc<SessionEntry>,
    source: &mut WsSource,
) {
    while let Some(result) = next_frame(source).await {
        match result {
            Ok(frame) => hub.handle_frame(entry, frame).await,
            Err(err) => {
                // Undecodable frames are dropped with a diagnostic;
                // the connection itself stays up.
                state.metrics.mark_rejected();
                warn!(session = %entry.session_id, error = %err, "dropping undecodable frame");
                let notice = Frame {
                    sequence: entry.next_sequence(),
                    frame_type: FrameType::Error,
                    payload: ControlEnvelope {
                        properties: json!({"error": "malformed-frame"}),
                    },
                };
                if entry.sender.send(notice).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Outbound half: the single writer for this connection. Drains the
/// session queue and interleaves keepalive pings.
async fn write_loop(mut sink: WsSink, mut receiver: mpsc::Receiver<Frame>, keepalive: Duration) {
    let mut ticker = interval(keepalive);
    ticker.tick().await;
    loop {
        tokio::select! {
            frame = receiver.recv() => {
                let Some(frame) = frame else {
                    break;
                };
                let bytes = match frame.encode() {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!(error = %err, "dropping unencodable frame");
                        continue;
                    }
                };
                if sink.send(Message::Binary(bytes)).await.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}

async fn reject_handshake(sink: &mut WsSink, code: &str) {
    let frame = Frame {
        sequence: 0,
        frame_type: FrameType::Error,
        payload: ControlEnvelope {
            properties: json!({"error": code}),
        },
    };
    if let Ok(bytes) = frame.encode() {
        let _ = sink.send(Message::Binary(bytes)).await;
    }
    let _ = sink.close().await;
}
