//! Shared helpers for the end-to-end tests: a server on an ephemeral port
//! and a minimal WebSocket peer that keeps its own replica of the document.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use logos_sync::protocol::{Message, SyncMessage};
use logos_sync::server::SyncServer;
use logos_sync::{sync, ServerConfig};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use yrs::{Doc, GetString, Text, Transact};

/// Start a server on a free port, return the port and a handle to it.
pub async fn start_test_server(config: ServerConfig) -> (u16, Arc<SyncServer>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Arc::new(SyncServer::new(ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..config
    }));
    let running = server.clone();
    tokio::spawn(async move {
        running.serve(listener).await.unwrap();
    });
    (port, server)
}

pub async fn start_default_server() -> (u16, Arc<SyncServer>) {
    start_test_server(ServerConfig::default()).await
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// A raw protocol client with a local yrs replica.
pub struct TestPeer {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pub doc: Doc,
}

impl TestPeer {
    pub async fn connect(port: u16, room: &str) -> Self {
        Self::connect_with_doc(port, room, Doc::new()).await
    }

    pub async fn connect_with_doc(port: u16, room: &str, doc: Doc) -> Self {
        let url = format!("ws://127.0.0.1:{port}/{room}");
        let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        Self { ws, doc }
    }

    /// Connect and consume the server's opening step 1.
    pub async fn join(port: u16, room: &str) -> Self {
        let mut peer = Self::connect(port, room).await;
        match peer.recv().await {
            Message::Sync(SyncMessage::Step1(_)) => {}
            other => panic!("expected step 1 first, got {other:?}"),
        }
        peer
    }

    pub async fn send(&mut self, msg: &Message) {
        self.send_raw(msg.encode()).await;
    }

    pub async fn send_raw(&mut self, bytes: Vec<u8>) {
        self.ws.send(WsMessage::Binary(bytes.into())).await.unwrap();
    }

    pub async fn recv(&mut self) -> Message {
        self.try_recv(Duration::from_secs(2))
            .await
            .expect("timed out waiting for a frame")
    }

    /// Next protocol message, or `None` if nothing arrives within `wait`.
    pub async fn try_recv(&mut self, wait: Duration) -> Option<Message> {
        loop {
            match timeout(wait, self.ws.next()).await.ok()?? {
                Ok(WsMessage::Binary(data)) => return Some(Message::decode(&data).unwrap()),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Apply every document update that arrives until the connection is quiet.
    pub async fn drain(&mut self) -> Vec<Message> {
        let mut other = Vec::new();
        while let Some(msg) = self.try_recv(Duration::from_millis(300)).await {
            match msg {
                Message::Sync(SyncMessage::Step2(update)) | Message::Sync(SyncMessage::Update(update)) => {
                    sync::apply_update(&self.doc, &update).unwrap();
                }
                msg => other.push(msg),
            }
        }
        other
    }

    /// Insert locally and ship the resulting update.
    pub async fn insert(&mut self, index: u32, chunk: &str) {
        let update = {
            let text = self.doc.get_or_insert_text("content");
            let mut txn = self.doc.transact_mut();
            text.insert(&mut txn, index, chunk);
            txn.encode_update_v1()
        };
        self.send(&Message::Sync(SyncMessage::Update(update))).await;
    }

    pub fn content(&self) -> String {
        let text = self.doc.get_or_insert_text("content");
        let txn = self.doc.transact();
        text.get_string(&txn)
    }

    pub fn len(&self) -> u32 {
        let text = self.doc.get_or_insert_text("content");
        let txn = self.doc.transact();
        text.len(&txn)
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}
