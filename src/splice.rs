//! Bidirectional byte pump between one WebSocket and one upstream TCP socket.
//!
//! Payload passes through untouched in both directions: inbound binary frames
//! become TCP writes of exactly their bytes, and every TCP read becomes
//! exactly one outbound binary frame. Text frames are inspected for JSON
//! control messages first; anything that does not parse is forwarded verbatim
//! for the benefit of legacy SDKs.

use axum::body::Bytes;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use crate::models::{pong_text, ControlMessage};
use crate::registry::{ConnectionRecord, ConnectionRegistry};

const TCP_READ_BUF: usize = 16 * 1024;

/// Out-of-band instructions for the server->client half of the pump. They
/// share the outbound FIFO with proxied bytes.
#[derive(Debug)]
pub enum SpliceCommand {
    /// Heartbeat probe.
    Ping,
    /// In-band JSON reply (pong frames).
    SendText(String),
    /// Close the WebSocket with the given code and stop.
    Terminate { code: u16, reason: String },
    /// The client->server task finished; upstream write side is half-closed.
    ClientGone,
}

/// What became of one inbound client frame.
enum Forward {
    Continue,
    /// Client sent a close frame.
    Closed,
    /// Upstream write failed.
    Failed,
}

enum TextAction {
    Reply(String),
    Observed(&'static str),
    Ignored(String),
    Passthrough,
}

fn classify_text(text: &str) -> TextAction {
    match serde_json::from_str::<ControlMessage>(text) {
        Ok(ctrl) => match ctrl.typ.as_str() {
            "ping" => TextAction::Reply(pong_text()),
            "resize" => TextAction::Observed("resize"),
            "quality" => TextAction::Observed("quality"),
            "clipboard" => TextAction::Observed("clipboard"),
            _ => TextAction::Ignored(ctrl.typ),
        },
        Err(_) => TextAction::Passthrough,
    }
}

async fn forward_client_frame(
    msg: Message,
    tcp_write: &mut OwnedWriteHalf,
    record: &ConnectionRecord,
    text_passthrough: bool,
) -> Forward {
    match msg {
        Message::Binary(data) => {
            record.touch();
            if tcp_write.write_all(&data).await.is_err() {
                return Forward::Failed;
            }
            Forward::Continue
        }
        Message::Text(text) => match classify_text(&text) {
            TextAction::Reply(reply) => {
                record.mark_alive();
                record.send_text(reply);
                Forward::Continue
            }
            TextAction::Observed(kind) => {
                debug!(connection = %record.id, kind, "control message observed");
                record.touch();
                Forward::Continue
            }
            TextAction::Ignored(kind) => {
                debug!(connection = %record.id, kind, "unknown control message ignored");
                Forward::Continue
            }
            TextAction::Passthrough => {
                if text_passthrough {
                    record.touch();
                    if tcp_write.write_all(text.as_bytes()).await.is_err() {
                        return Forward::Failed;
                    }
                } else {
                    debug!(connection = %record.id, "dropped unparseable text frame");
                }
                Forward::Continue
            }
        },
        Message::Pong(_) => {
            record.mark_alive();
            Forward::Continue
        }
        Message::Ping(_) => {
            // The transport answers pings itself; just note the activity.
            record.touch();
            Forward::Continue
        }
        Message::Close(_) => Forward::Closed,
    }
}

async fn send_close(sink: &mut SplitSink<WebSocket, Message>, code: u16, reason: &str) {
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

/// Pump bytes until either side goes away, then release the record.
///
/// `buffered` holds the frames captured while the upstream dial was in
/// flight; they are written first, in arrival order, one TCP write each.
pub async fn run(
    socket: WebSocket,
    stream: TcpStream,
    buffered: Vec<Message>,
    record: Arc<ConnectionRecord>,
    mut control_rx: UnboundedReceiver<SpliceCommand>,
    registry: Arc<ConnectionRegistry>,
    text_passthrough: bool,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (mut tcp_read, mut tcp_write) = stream.into_split();

    for msg in buffered {
        match forward_client_frame(msg, &mut tcp_write, &record, text_passthrough).await {
            Forward::Continue => {}
            Forward::Closed => {
                let _ = tcp_write.shutdown().await;
                registry.unregister(&record.vm_id, &record.id);
                return;
            }
            Forward::Failed => {
                send_close(&mut ws_tx, close_code::ERROR, "internal error").await;
                registry.unregister(&record.vm_id, &record.id);
                return;
            }
        }
    }

    // Client -> upstream. Owns the WebSocket read half and the TCP write
    // half; half-closes the upstream when the client side finishes. An
    // upstream write failure is a transport error, not a goodbye, and must
    // surface to the client as a 1011 close.
    let client_task = tokio::spawn({
        let record = record.clone();
        async move {
            let mut write_failed = false;
            while let Some(result) = ws_rx.next().await {
                match result {
                    Ok(msg) => {
                        match forward_client_frame(msg, &mut tcp_write, &record, text_passthrough)
                            .await
                        {
                            Forward::Continue => {}
                            Forward::Closed => {
                                debug!(connection = %record.id, "client closed WebSocket");
                                break;
                            }
                            Forward::Failed => {
                                warn!(connection = %record.id, "upstream write failed");
                                write_failed = true;
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        debug!(connection = %record.id, error = %e, "WebSocket receive error");
                        break;
                    }
                }
            }
            let _ = tcp_write.shutdown().await;
            let command = if write_failed {
                SpliceCommand::Terminate {
                    code: close_code::ERROR,
                    reason: "internal error".to_string(),
                }
            } else {
                SpliceCommand::ClientGone
            };
            let _ = record.control_sender().send(command);
        }
    });

    // Upstream -> client, sharing the outbound sink with control traffic.
    let mut buf = vec![0u8; TCP_READ_BUF];
    loop {
        tokio::select! {
            cmd = control_rx.recv() => match cmd {
                Some(SpliceCommand::Ping) => {
                    if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
                Some(SpliceCommand::SendText(text)) => {
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(SpliceCommand::Terminate { code, reason }) => {
                    send_close(&mut ws_tx, code, &reason).await;
                    break;
                }
                Some(SpliceCommand::ClientGone) | None => break,
            },
            read = tcp_read.read(&mut buf) => match read {
                Ok(0) => {
                    debug!(connection = %record.id, "upstream closed connection");
                    send_close(&mut ws_tx, close_code::NORMAL, "VNC connection closed").await;
                    break;
                }
                Ok(n) => {
                    record.touch();
                    if ws_tx
                        .send(Message::Binary(Bytes::copy_from_slice(&buf[..n])))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    warn!(connection = %record.id, error = %e, "upstream read error");
                    send_close(&mut ws_tx, close_code::ERROR, "internal error").await;
                    break;
                }
            }
        }
    }

    client_task.abort();
    registry.unregister(&record.vm_id, &record.id);
    info!(connection = %record.id, vm = %record.vm_id, "session closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_gets_a_pong_reply() {
        match classify_text(r#"{"type":"ping"}"#) {
            TextAction::Reply(reply) => {
                let value: serde_json::Value = serde_json::from_str(&reply).unwrap();
                assert_eq!(value["type"], "pong");
                assert!(value["timestamp"].is_i64());
            }
            _ => panic!("expected a pong reply"),
        }
    }

    #[test]
    fn known_control_messages_have_no_tcp_side_effect() {
        assert!(matches!(
            classify_text(r#"{"type":"resize","width":800,"height":600}"#),
            TextAction::Observed("resize")
        ));
        assert!(matches!(
            classify_text(r#"{"type":"clipboard","data":"hi"}"#),
            TextAction::Observed("clipboard")
        ));
    }

    #[test]
    fn unknown_types_are_ignored_not_forwarded() {
        assert!(matches!(
            classify_text(r#"{"type":"telemetry"}"#),
            TextAction::Ignored(_)
        ));
    }

    #[test]
    fn non_json_text_falls_through_to_the_wire() {
        assert!(matches!(
            classify_text("RFB 003.008\n"),
            TextAction::Passthrough
        ));
        assert!(matches!(classify_text("{broken"), TextAction::Passthrough));
    }
}
