//! In-process WebSocket fixture servers for engine/router/server tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

/// What one accepted upstream connection does.
#[derive(Clone)]
pub enum Script {
    /// Send the frames, then hold the socket open silently.
    SendThenSilent(Vec<String>),
    /// Send the frames, then close cleanly.
    SendThenClose(Vec<String>),
    /// Wait, send the frames, then hold the socket open silently.
    DelayThenSend(Duration, Vec<String>),
    /// Wait, then send the frames one by one with a gap between them.
    SendSpaced {
        /// Delay before the first frame.
        initial: Duration,
        /// Gap between consecutive frames.
        gap: Duration,
        /// Frames to send.
        frames: Vec<String>,
    },
    /// Accept and hold the socket open silently.
    Silent,
}

/// Spawn a venue fixture; the nth accepted connection runs the nth script
/// (later connections fall back to `Silent`).
pub async fn spawn_fixture(scripts: Vec<Script>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut scripts = scripts.into_iter();
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let script = scripts.next().unwrap_or(Script::Silent);
            tokio::spawn(run_script(stream, script));
        }
    });
    addr
}

/// A port that refuses connections: bound once, then released.
pub async fn refused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

async fn run_script(stream: TcpStream, script: Script) {
    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    match script {
        Script::SendThenSilent(frames) => {
            send_all(&mut ws, frames).await;
            hold_open(&mut ws).await;
        }
        Script::SendThenClose(frames) => {
            send_all(&mut ws, frames).await;
            let _ = ws.close(None).await;
        }
        Script::DelayThenSend(delay, frames) => {
            tokio::time::sleep(delay).await;
            send_all(&mut ws, frames).await;
            hold_open(&mut ws).await;
        }
        Script::SendSpaced {
            initial,
            gap,
            frames,
        } => {
            tokio::time::sleep(initial).await;
            for frame in frames {
                if ws.send(Message::Text(frame.into())).await.is_err() {
                    return;
                }
                tokio::time::sleep(gap).await;
            }
            hold_open(&mut ws).await;
        }
        Script::Silent => hold_open(&mut ws).await,
    }
}

async fn send_all(ws: &mut tokio_tungstenite::WebSocketStream<TcpStream>, frames: Vec<String>) {
    for frame in frames {
        if ws.send(Message::Text(frame.into())).await.is_err() {
            return;
        }
    }
}

async fn hold_open(ws: &mut tokio_tungstenite::WebSocketStream<TcpStream>) {
    while let Some(Ok(message)) = ws.next().await {
        if let Message::Ping(payload) = message {
            let _ = ws.send(Message::Pong(payload)).await;
        }
    }
}
