//! Single-connection link server.

use std::path::Path;

use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};
use updraft_core::ipc::{Message, MessageCodec};

use crate::event::{Event, LinkEvent, LinkSide};

/// Handle for sending messages to a link's peer.
///
/// Messages queue until the peer connects; if the link never comes up or
/// has gone away, sends are silently dropped (the controller learns about
/// peer loss through `LinkEvent::Invalidated`, not through send errors).
#[derive(Debug, Clone)]
pub struct LinkHandle {
    outbound: mpsc::UnboundedSender<Message>,
}

impl LinkHandle {
    /// Queue a message for the peer.
    pub fn send(&self, message: Message) {
        if self.outbound.send(message).is_err() {
            debug!("dropping message for closed link");
        }
    }
}

/// Bind a link listener, replacing any stale socket file.
///
/// # Errors
///
/// Returns an IO error if the stale socket cannot be removed or the bind
/// fails.
pub fn bind_link_socket(path: &Path) -> std::io::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    UnixListener::bind(path)
}

/// Spawn the server task for one link.
///
/// The task waits for the single peer connection, emits
/// `LinkEvent::Connected`, then pumps frames in both directions until the
/// peer drops (`LinkEvent::Invalidated`) or the daemon drops the returned
/// handle. Every further connection attempt is accepted and immediately
/// closed.
pub fn spawn_link_server(
    listener: UnixListener,
    side: LinkSide,
    events: mpsc::UnboundedSender<Event>,
) -> LinkHandle {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let stream = loop {
            match listener.accept().await {
                Ok((stream, _addr)) => break stream,
                Err(error) => {
                    warn!(?side, %error, "link accept failed");
                },
            }
        };
        info!(?side, "peer connected");
        let _ = events.send(Event::Link(side, LinkEvent::Connected));

        // The active peer holds the link for the daemon's lifetime;
        // reject everyone else without touching it.
        let rejector = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        warn!(?side, "rejecting concurrent connection");
                        drop(stream);
                    },
                    Err(error) => {
                        debug!(?side, %error, "accept failed while rejecting");
                    },
                }
            }
        });

        serve_connection(stream, side, events, outbound_rx).await;
        rejector.abort();
    });

    LinkHandle {
        outbound: outbound_tx,
    }
}

async fn serve_connection(
    stream: UnixStream,
    side: LinkSide,
    events: mpsc::UnboundedSender<Event>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) {
    let framed = Framed::new(stream, MessageCodec::new());
    let (mut sink, mut inbound) = framed.split();

    loop {
        tokio::select! {
            frame = inbound.next() => match frame {
                Some(Ok(message)) => {
                    let _ = events.send(Event::Link(side, LinkEvent::Message(message)));
                },
                Some(Err(error)) => {
                    warn!(?side, %error, "link protocol error");
                    let _ = events.send(Event::Link(side, LinkEvent::Invalidated));
                    return;
                },
                None => {
                    info!(?side, "peer disconnected");
                    let _ = events.send(Event::Link(side, LinkEvent::Invalidated));
                    return;
                },
            },
            message = outbound.recv() => match message {
                Some(message) => {
                    if let Err(error) = sink.send(message).await {
                        warn!(?side, %error, "link write failed");
                        let _ = events.send(Event::Link(side, LinkEvent::Invalidated));
                        return;
                    }
                },
                // The daemon dropped the handle; close the socket.
                None => return,
            },
        }
    }
}
