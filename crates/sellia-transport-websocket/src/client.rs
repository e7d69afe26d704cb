//! Client-side framing: wraps a `tokio-tungstenite` stream, used by
//! `sellia-client` to dial the server's `/ws` endpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace, warn};

use sellia_proto::{decode, encode, Message};

use crate::channel::{ControlChannel, INBOUND_QUEUE_DEPTH, OUTBOUND_QUEUE_DEPTH};

/// Spawns the writer and reader tasks for a dialed client-side control
/// channel over any `AsyncRead + AsyncWrite` transport tokio-tungstenite
/// has already upgraded to a WebSocket (plain TCP or TLS).
pub fn spawn<S>(connection_id: String, ws: WebSocketStream<S>) -> (ControlChannel, mpsc::Receiver<Message>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE_DEPTH);
    let (inbound_tx, inbound_rx) = mpsc::channel::<Message>(INBOUND_QUEUE_DEPTH);
    let closed = Arc::new(AtomicBool::new(false));
    let shutdown = Arc::new(Notify::new());

    let writer_closed = closed.clone();
    let writer_shutdown = shutdown.clone();
    let writer_id = connection_id.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = writer_shutdown.notified() => break,
                msg = outbound_rx.recv() => {
                    let Some(msg) = msg else { break };
                    let frame = match encode(&msg) {
                        Ok(frame) => frame,
                        Err(err) => {
                            warn!(connection_id = %writer_id, %err, "failed to encode outbound message");
                            continue;
                        }
                    };
                    if sink.send(WsMessage::Binary(frame)).await.is_err() {
                        break;
                    }
                }
            }
        }
        writer_closed.store(true, Ordering::Release);
        let _ = sink.close().await;
        debug!(connection_id = %writer_id, "control channel writer task ended");
    });

    let reader_closed = closed.clone();
    let reader_shutdown = shutdown.clone();
    let reader_id = connection_id.clone();
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                biased;
                _ = reader_shutdown.notified() => break,
                frame = stream.next() => frame,
            };
            match frame {
                Some(Ok(WsMessage::Binary(bytes))) => match decode(&bytes) {
                    Ok(msg) => {
                        trace!(connection_id = %reader_id, tag = %msg.tag(), "decoded inbound message");
                        if inbound_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(connection_id = %reader_id, %err, "malformed frame, closing control channel");
                        reader_shutdown.notify_one();
                        break;
                    }
                },
                Some(Ok(WsMessage::Close(_))) => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(connection_id = %reader_id, %err, "control channel read error");
                    break;
                }
                None => break,
            }
        }
        reader_closed.store(true, Ordering::Release);
        debug!(connection_id = %reader_id, "control channel reader task ended");
    });

    (
        ControlChannel::new(connection_id, outbound_tx, closed, shutdown),
        inbound_rx,
    )
}
