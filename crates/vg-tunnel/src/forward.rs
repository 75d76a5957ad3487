//! Local port forwarding
//!
//! A `LocalForward` owns a listener on an ephemeral loopback port. Every
//! accepted connection is relayed through a fresh channel opened by a
//! `ForwardTarget`.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use vg_core::SessionError;

/// A bidirectional byte stream carried over the session
pub trait ForwardStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ForwardStream for T {}

/// Why a forwarded channel could not be opened
#[derive(Debug)]
pub enum OpenError {
    /// The remote side refused this one channel; the session is fine
    Refused(String),
    /// The session itself is gone
    SessionLost(String),
}

/// Opens one channel per accepted local connection
#[async_trait]
pub trait ForwardTarget: Send + Sync + 'static {
    async fn open(&self, originator: SocketAddr) -> Result<Box<dyn ForwardStream>, OpenError>;
}

/// A listening local forward
#[derive(Debug)]
pub struct LocalForward {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl LocalForward {
    /// Bind an ephemeral loopback port and start relaying to `target`.
    ///
    /// `session_lost` is cancelled if opening a channel shows that the
    /// session has died.
    pub async fn bind(
        target: Arc<dyn ForwardTarget>,
        session_lost: CancellationToken,
    ) -> Result<Self, SessionError> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(|e| SessionError::Tunnel(format!("Failed to bind local port: {}", e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| SessionError::Tunnel(format!("Failed to read local address: {}", e)))?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            listener,
            target,
            cancel.clone(),
            session_lost,
        ));

        tracing::debug!("Local forward listening on {}", local_addr);
        Ok(Self {
            local_addr,
            cancel,
            task: Some(task),
        })
    }

    /// Local address callers connect to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop listening and drop every relayed connection
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for LocalForward {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    target: Arc<dyn ForwardTarget>,
    cancel: CancellationToken,
    session_lost: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!("Failed to accept forwarded connection: {}", e);
                    continue;
                }
            },
        };

        let opened = tokio::select! {
            _ = cancel.cancelled() => break,
            opened = target.open(peer) => opened,
        };

        match opened {
            Ok(channel) => {
                tokio::spawn(relay(stream, channel, cancel.clone()));
            }
            Err(OpenError::Refused(reason)) => {
                // Only this connection fails
                tracing::debug!("Forwarded connection from {} refused: {}", peer, reason);
                drop(stream);
            }
            Err(OpenError::SessionLost(reason)) => {
                tracing::warn!("Session lost while forwarding: {}", reason);
                session_lost.cancel();
                break;
            }
        }
    }
}

async fn relay(mut stream: TcpStream, mut channel: Box<dyn ForwardStream>, cancel: CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        result = tokio::io::copy_bidirectional(&mut stream, &mut channel) => {
            match result {
                Ok((sent, received)) => {
                    tracing::trace!("Relay finished: {} bytes out, {} bytes in", sent, received);
                }
                Err(e) => tracing::debug!("Relay ended: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Connects every channel to a plain TCP echo-style server
    struct TcpTarget {
        addr: SocketAddr,
        refuse: AtomicBool,
        lose: AtomicBool,
    }

    #[async_trait]
    impl ForwardTarget for TcpTarget {
        async fn open(&self, _originator: SocketAddr) -> Result<Box<dyn ForwardStream>, OpenError> {
            if self.lose.load(Ordering::SeqCst) {
                return Err(OpenError::SessionLost("gone".into()));
            }
            if self.refuse.load(Ordering::SeqCst) {
                return Err(OpenError::Refused("connect failed".into()));
            }
            let stream = TcpStream::connect(self.addr)
                .await
                .map_err(|e| OpenError::Refused(e.to_string()))?;
            Ok(Box::new(stream))
        }
    }

    async fn upper_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 64];
                    let n = socket.read(&mut buf).await.unwrap();
                    let reply = buf[..n].to_ascii_uppercase();
                    socket.write_all(&reply).await.unwrap();
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_relays_bytes_both_ways() {
        let target = Arc::new(TcpTarget {
            addr: upper_server().await,
            refuse: AtomicBool::new(false),
            lose: AtomicBool::new(false),
        });
        let forward = LocalForward::bind(target, CancellationToken::new())
            .await
            .unwrap();
        assert!(forward.local_addr().ip().is_loopback());

        let mut client = TcpStream::connect(forward.local_addr()).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PING");

        forward.close().await;
    }

    #[tokio::test]
    async fn test_refused_channel_keeps_listening() {
        let target = Arc::new(TcpTarget {
            addr: upper_server().await,
            refuse: AtomicBool::new(true),
            lose: AtomicBool::new(false),
        });
        let lost = CancellationToken::new();
        let forward = LocalForward::bind(target.clone(), lost.clone())
            .await
            .unwrap();

        let mut refused = TcpStream::connect(forward.local_addr()).await.unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(refused.read(&mut buf).await.unwrap(), 0);
        assert!(!lost.is_cancelled());

        target.refuse.store(false, Ordering::SeqCst);
        let mut client = TcpStream::connect(forward.local_addr()).await.unwrap();
        client.write_all(b"ok").await.unwrap();
        client.read_exact(&mut buf[..2]).await.unwrap();
        assert_eq!(&buf[..2], b"OK");
    }

    #[tokio::test]
    async fn test_session_loss_is_signalled() {
        let target = Arc::new(TcpTarget {
            addr: upper_server().await,
            refuse: AtomicBool::new(false),
            lose: AtomicBool::new(true),
        });
        let lost = CancellationToken::new();
        let forward = LocalForward::bind(target, lost.clone()).await.unwrap();

        let _client = TcpStream::connect(forward.local_addr()).await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), lost.cancelled())
            .await
            .unwrap();
    }
}
