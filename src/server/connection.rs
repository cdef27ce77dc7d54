//! Per-link task: pumps frames between one WebSocket and the registry.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};

use super::link::LinkHandle;
use super::registry::SessionRegistry;
use crate::protocol::encode;

/// Runs the read/write loop for a single rover link until it closes.
///
/// - Text frames from the rover go to [`SessionRegistry::handle_frame`].
/// - Envelopes queued on the link's handle are written to the socket.
/// - A close request from the registry ends the loop.
///
/// [`SessionRegistry::on_link_close`] always runs on exit.
pub async fn run_link(
    socket: WebSocket,
    registry: Arc<SessionRegistry>,
    remote_addr: Option<SocketAddr>,
    queue_capacity: usize,
) {
    let (handle, mut link_rx) = LinkHandle::channel(remote_addr, queue_capacity);
    let link = handle.id();
    registry.on_link_open(handle).await;

    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = registry.handle_frame(link, text.as_str()).await {
                            tracing::warn!(%link, error = %e, "frame handling failed");
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(%link, error = %e, "link read failed");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
            Some(envelope) = link_rx.outbound.recv() => {
                if ws_tx.send(Message::text(encode(&envelope))).await.is_err() {
                    break;
                }
            }
            Ok(()) = link_rx.close.changed() => {
                if *link_rx.close.borrow_and_update() {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }

    if let Err(e) = registry.on_link_close(link).await {
        tracing::warn!(%link, error = %e, "failed to persist link close");
    }
}
