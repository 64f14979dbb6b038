// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Unix domain socket transport.

use std::io;
use std::path::Path;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{UnixListener, UnixStream};

pub trait IpcIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> IpcIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type IpcStream = Box<dyn IpcIo>;

pub struct IpcListener {
    inner: UnixListener,
}

/// Bind `path`, replacing a stale socket file.
///
/// Fails with `AddrInUse` when a live listener still answers on `path`.
pub async fn bind(path: &Path) -> io::Result<IpcListener> {
    if path.exists() {
        if UnixStream::connect(path).await.is_ok() {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{} is in use", path.display()),
            ));
        }
        let _ = std::fs::remove_file(path);
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let inner = UnixListener::bind(path)?;
    Ok(IpcListener { inner })
}

pub async fn connect(path: &Path) -> io::Result<IpcStream> {
    let stream = UnixStream::connect(path).await?;
    Ok(Box::new(stream))
}

impl IpcListener {
    pub async fn accept(&self) -> io::Result<IpcStream> {
        let (stream, _addr) = self.inner.accept().await?;
        Ok(Box::new(stream))
    }
}

pub fn cleanup(path: &Path) -> io::Result<()> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_socket_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("fj.sock");
        let listener = bind(&path).await.expect("bind failed");

        let server = tokio::spawn(async move {
            let mut stream = listener.accept().await.expect("accept failed");
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.expect("read failed");
            assert_eq!(&buf, b"hello");
            stream.write_all(b"world").await.expect("write failed");
            stream.flush().await.expect("flush failed");
        });

        let mut client = connect(&path).await.expect("connect failed");
        client.write_all(b"hello").await.unwrap();
        client.flush().await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        server.await.expect("server task failed");
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let temp = TempDir::new().unwrap();
        let fake_socket = temp.path().join("nonexistent.sock");

        let result = connect(&fake_socket).await;
        match result {
            Err(err) => assert!(
                err.kind() == io::ErrorKind::NotFound || err.kind() == io::ErrorKind::ConnectionRefused,
                "Expected NotFound or ConnectionRefused, got {:?}",
                err.kind()
            ),
            Ok(_) => panic!("Should fail to connect to non-existent socket"),
        }
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("fj.sock");
        std::fs::write(&path, b"stale").unwrap();

        let listener = bind(&path).await;
        assert!(listener.is_ok());
    }

    #[tokio::test]
    async fn test_bind_refuses_live_socket() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("fj.sock");
        let _first = bind(&path).await.unwrap();

        let err = bind(&path).await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }

    #[test]
    fn test_cleanup_missing_is_ok() {
        let temp = TempDir::new().unwrap();
        assert!(cleanup(&temp.path().join("gone.sock")).is_ok());
    }
}
