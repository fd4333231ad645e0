//! Stanza stream connection
//!
//! The focus attaches to its chat service over a local stanza stream:
//! newline-delimited XML elements on a TCP socket, the framing a co-located
//! connection manager speaks. The driver owns reconnection with backoff
//! and tells the adapter about registration transitions so higher layers
//! can re-establish their subscriptions.

use async_trait::async_trait;
use confocus_xmpp_core::{Element, Stanza, XmppAdapter, XmppError, XmppTransport};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const RECONNECT_FLOOR: Duration = Duration::from_secs(1);
const RECONNECT_CEILING: Duration = Duration::from_secs(30);

/// Transport half: rendered stanzas go onto the connection's write queue.
pub struct StreamTransport {
    tx: mpsc::UnboundedSender<String>,
}

impl StreamTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl XmppTransport for StreamTransport {
    async fn send(&self, stanza: Stanza) -> Result<(), XmppError> {
        let xml = stanza.to_element().render()?;
        self.tx.send(xml).map_err(|_| XmppError::AdapterOffline)
    }
}

/// Connect-and-reconnect loop. Runs until the process exits.
pub async fn drive(
    adapter: XmppAdapter,
    addr: String,
    mut outbound: mpsc::UnboundedReceiver<String>,
) {
    let mut backoff = RECONNECT_FLOOR;
    loop {
        let stream = match TcpStream::connect(&addr).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!("connect to {} failed: {}; retrying in {:?}", addr, err, backoff);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RECONNECT_CEILING);
                continue;
            }
        };
        info!("connected to chat service at {}", addr);
        backoff = RECONNECT_FLOOR;
        adapter.registration_changed(true);

        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            let line = line.trim();
                            if line.is_empty() {
                                continue;
                            }
                            match Element::parse(line).and_then(|el| Stanza::from_element(&el)) {
                                Ok(stanza) => adapter.handle_inbound(stanza),
                                Err(err) => debug!("unparseable inbound stanza: {}", err),
                            }
                        }
                        Ok(None) => {
                            warn!("chat service closed the stream");
                            break;
                        }
                        Err(err) => {
                            warn!("read error on chat stream: {}", err);
                            break;
                        }
                    }
                }
                xml = outbound.recv() => {
                    let Some(xml) = xml else {
                        // Adapter gone; nothing left to drive.
                        return;
                    };
                    if let Err(err) = write_half.write_all(xml.as_bytes()).await {
                        warn!("write error on chat stream: {}", err);
                        break;
                    }
                    if let Err(err) = write_half.write_all(b"\n").await {
                        warn!("write error on chat stream: {}", err);
                        break;
                    }
                }
            }
        }
        adapter.registration_changed(false);
    }
}
