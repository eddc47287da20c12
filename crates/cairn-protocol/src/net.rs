//! Minimal TCP realization of the bus seam so the node binaries can run
//! as separate processes: newline-delimited JSON frames through a relay
//! embedded in the authority. Nothing above this module knows whether
//! envelopes crossed a socket or an in-process channel.

use crate::bus::{Bus, LocalBus};
use crate::error::ProtocolError;
use crate::message::Envelope;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// First line a client sends: the routing keys it wants delivered.
#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    bindings: Vec<String>,
}

/// Every subsequent line, in both directions.
#[derive(Debug, Serialize, Deserialize)]
struct Frame {
    key: String,
    envelope: Envelope,
}

/// Accept loop for the relay. Each connection declares its bindings,
/// then exchanges frames; the shared [`LocalBus`] does the switching.
pub async fn serve_relay(listener: TcpListener, bus: Arc<LocalBus>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tracing::info!(peer = %addr, "bus client connected");
                let bus = bus.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_client(stream, bus).await {
                        tracing::warn!(peer = %addr, error = %e, "bus client dropped");
                    }
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
            }
        }
    }
}

async fn serve_client(stream: TcpStream, bus: Arc<LocalBus>) -> Result<(), ProtocolError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let hello_line = lines
        .next_line()
        .await?
        .ok_or(ProtocolError::Closed)?;
    let hello: Hello = serde_json::from_str(&hello_line)
        .map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let mut inbound = bus.attach(&hello.bindings);
    let writer = tokio::spawn(async move {
        while let Some(envelope) = inbound.recv().await {
            // The client already knows its own bindings; the key is only
            // needed client-to-relay, so relay-to-client reuses the
            // envelope's source-addressed frame with an empty key.
            let frame = Frame { key: String::new(), envelope };
            let Ok(mut line) = serde_json::to_string(&frame) else {
                continue;
            };
            line.push('\n');
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    while let Some(line) = lines.next_line().await? {
        match serde_json::from_str::<Frame>(&line) {
            Ok(frame) => bus.send(&frame.key, frame.envelope).await?,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed frame");
            }
        }
    }

    writer.abort();
    Ok(())
}

/// Client side of the relay. `send` enqueues frames to a writer task;
/// inbound envelopes for the declared bindings arrive on the returned
/// channel.
pub struct RemoteBus {
    outbound: mpsc::UnboundedSender<Frame>,
}

impl RemoteBus {
    /// Connects to the relay, retrying with a fixed backoff until it is
    /// reachable, and declares the given bindings.
    pub async fn connect(
        addr: &str,
        bindings: Vec<String>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<Envelope>), ProtocolError> {
        let stream = loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => break stream,
                Err(e) => {
                    tracing::warn!(addr, error = %e, "bus relay unreachable, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        };
        tracing::info!(addr, "connected to bus relay");

        let (read_half, mut write_half) = stream.into_split();
        let hello = Hello { bindings };
        let mut line = serde_json::to_string(&hello)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        line.push('\n');
        write_half.write_all(line.as_bytes()).await?;

        let (outbound, outbound_rx) = mpsc::unbounded_channel::<Frame>();
        tokio::spawn(write_loop(write_half, outbound_rx));

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Envelope>();
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match serde_json::from_str::<Frame>(&line) {
                        Ok(frame) => {
                            if inbound_tx.send(frame.envelope).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "dropping malformed frame");
                        }
                    },
                    Ok(None) => {
                        tracing::error!("bus relay closed the connection");
                        break;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "bus read failed");
                        break;
                    }
                }
            }
        });

        Ok((Arc::new(Self { outbound }), inbound_rx))
    }
}

async fn write_loop(mut write_half: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        let Ok(mut line) = serde_json::to_string(&frame) else {
            continue;
        };
        line.push('\n');
        if let Err(e) = write_half.write_all(line.as_bytes()).await {
            tracing::error!(error = %e, "bus write failed");
            break;
        }
    }
}

#[async_trait]
impl Bus for RemoteBus {
    async fn send(&self, key: &str, envelope: Envelope) -> Result<(), ProtocolError> {
        self.outbound
            .send(Frame { key: key.to_string(), envelope })
            .map_err(|_| ProtocolError::Closed)
    }
}
