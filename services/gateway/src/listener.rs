//! Listener endpoints for OUTPUT routes.
//!
//! A listener yields raw FIX payloads one at a time into a channel the
//! output worker drains. Two schemes listen: `netty:tcp://host:port` binds
//! a line-oriented TCP acceptor (one payload per line, `OK` reply per
//! line), and `direct:<name>` registers an in-process channel. The `OK`
//! acknowledges acceptance by the gateway; publishing happens on the
//! worker.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::error::GatewayError;

const CHANNEL_CAPACITY: usize = 1024;

/// Bind a TCP line listener and return the stream of inbound payloads.
pub async fn spawn_tcp_listener(
    addr: &str,
    shutdown: watch::Receiver<bool>,
) -> Result<mpsc::Receiver<String>, GatewayError> {
    let listener = TcpListener::bind(addr).await.map_err(|error| {
        GatewayError::Supervisor(format!("failed to bind listener on {addr}: {error}"))
    })?;
    info!(addr, "📡 listener accepting FIX connections");

    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(accept_loop(listener, tx, shutdown));
    Ok(rx)
}

async fn accept_loop(
    listener: TcpListener,
    tx: mpsc::Sender<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "inbound FIX connection");
                    tokio::spawn(handle_connection(stream, tx.clone(), shutdown.clone()));
                }
                Err(error) => {
                    error!(%error, "accept failed");
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("listener accept loop stopped");
}

async fn handle_connection(
    stream: TcpStream,
    tx: mpsc::Sender<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "<unknown>".to_string());
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let payload = line.trim_end_matches('\r').to_string();
                    if payload.is_empty() {
                        continue;
                    }
                    if tx.send(payload).await.is_err() {
                        // Worker gone; shutdown is in progress.
                        break;
                    }
                    if !acknowledge(&mut write_half, &peer).await {
                        break;
                    }
                }
                Ok(None) => {
                    debug!(peer, "FIX endpoint disconnected");
                    break;
                }
                Err(error) => {
                    warn!(peer, %error, "read failed, dropping connection");
                    break;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn acknowledge(write_half: &mut OwnedWriteHalf, peer: &str) -> bool {
    if let Err(error) = write_half.write_all(b"OK\n").await {
        warn!(peer, %error, "failed to acknowledge payload");
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn yields_one_payload_per_line_and_acknowledges() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        // Bind on an ephemeral port, then discover it via a probe connection.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let mut rx = spawn_tcp_listener(&addr.to_string(), shutdown_rx).await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all("8=FIX.4.4\u{1}35=D\u{1}10=000\u{1}\n".as_bytes())
            .await
            .unwrap();

        let payload = rx.recv().await.unwrap();
        assert_eq!(payload, "8=FIX.4.4\u{1}35=D\u{1}10=000\u{1}");

        let mut reply = [0u8; 3];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"OK\n");
    }

    #[tokio::test]
    async fn blank_lines_are_ignored() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let mut rx = spawn_tcp_listener(&addr.to_string(), shutdown_rx).await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"\r\n8=FIX.4.4\x0135=D\x01\n").await.unwrap();

        let payload = rx.recv().await.unwrap();
        assert_eq!(payload, "8=FIX.4.4\u{1}35=D\u{1}");
    }
}
