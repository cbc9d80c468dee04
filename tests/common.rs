//! Test utilities: an in-process server on an ephemeral port and a framed test client.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use groupbbs::bbs::BbsServer;
use groupbbs::config::Config;
use groupbbs::net::{encode_frame, FrameReader};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub fn test_config(data_dir: &Path) -> Config {
    let mut config = Config::default();
    config.server.host = "127.0.0.1".into();
    config.server.port = 0;
    config.server.drain_timeout_secs = 2;
    config.storage.data_dir = data_dir.to_string_lossy().into_owned();
    config.logging.file = None;
    config
}

pub struct TestServer {
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    pub async fn start(data_dir: &Path) -> TestServer {
        Self::start_with(test_config(data_dir)).await
    }

    pub async fn start_with(config: Config) -> TestServer {
        let mut server = BbsServer::new(config).await.expect("server");
        let addr = server.bind().await.expect("bind");
        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            server
                .run_until(async {
                    let _ = rx.await;
                })
                .await
        });
        TestServer {
            addr,
            shutdown: Some(tx),
            handle,
        }
    }

    /// Trigger shutdown and wait for the server to drain and persist.
    pub async fn stop(mut self) -> anyhow::Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.handle.await.expect("server task")
    }

    /// Connect and complete the handshake.
    pub async fn connect(&self, handshake: &str) -> TestClient {
        let mut client = TestClient::open(self.addr).await;
        client.send(handshake).await;
        let reply = client.recv().await;
        let id = reply
            .strip_prefix("id ")
            .and_then(|n| n.parse().ok())
            .unwrap_or_else(|| panic!("unexpected handshake reply: {}", reply));
        client.id = id;
        client
    }
}

pub struct TestClient {
    pub id: u64,
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    /// Connect without sending a handshake.
    pub async fn open(addr: SocketAddr) -> TestClient {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read_half, write_half) = stream.into_split();
        TestClient {
            id: u64::MAX,
            reader: FrameReader::new(read_half, 64 * 1024),
            writer: write_half,
        }
    }

    pub async fn send(&mut self, line: &str) {
        self.writer
            .write_all(&encode_frame(line.as_bytes()))
            .await
            .expect("send");
    }

    pub async fn recv(&mut self) -> String {
        match tokio::time::timeout(RECV_TIMEOUT, self.reader.read_frame()).await {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => panic!("connection closed while waiting for a frame"),
            Ok(Err(e)) => panic!("read failed: {}", e),
            Err(_) => panic!("timed out waiting for a frame"),
        }
    }

    pub async fn request(&mut self, line: &str) -> String {
        self.send(line).await;
        self.recv().await
    }

    /// Read frames until one satisfies `pred`, returning it. Other frames are skipped.
    pub async fn recv_until(&mut self, pred: impl Fn(&str) -> bool) -> String {
        loop {
            let frame = self.recv().await;
            if pred(&frame) {
                return frame;
            }
        }
    }

    /// Assert nothing arrives within `wait`.
    pub async fn expect_silence(&mut self, wait: Duration) {
        if let Ok(frame) = tokio::time::timeout(wait, self.reader.read_frame()).await {
            panic!("expected no frame, got {:?}", frame.map_err(|e| e.to_string()));
        }
    }

    /// Assert the server closes the connection (pending frames are skipped).
    pub async fn expect_closed(&mut self) {
        loop {
            match tokio::time::timeout(RECV_TIMEOUT, self.reader.read_frame()).await {
                Ok(Ok(None)) | Ok(Err(_)) => return,
                Ok(Ok(Some(_))) => continue,
                Err(_) => panic!("connection was not closed"),
            }
        }
    }

    /// Drop the connection without sending `exit`.
    pub async fn disconnect(mut self) {
        let _ = self.writer.shutdown().await;
    }
}
