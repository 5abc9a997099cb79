//! Local stream transport between the daemon and its clients.
//!
//! On unix the endpoint is a domain socket. Elsewhere the daemon listens on a
//! loopback TCP port and writes the port number into the endpoint file.

use std::io;
use std::path::Path;

#[cfg(unix)]
pub type Stream = tokio::net::UnixStream;

#[cfg(not(unix))]
pub type Stream = tokio::net::TcpStream;

pub struct Listener {
    #[cfg(unix)]
    inner: tokio::net::UnixListener,
    #[cfg(not(unix))]
    inner: tokio::net::TcpListener,
}

/// Binds the endpoint, readable and writable by the current user only.
pub fn bind(endpoint: &Path) -> io::Result<Listener> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let inner = tokio::net::UnixListener::bind(endpoint)?;
        std::fs::set_permissions(endpoint, std::fs::Permissions::from_mode(0o600))?;
        Ok(Listener { inner })
    }

    #[cfg(not(unix))]
    {
        let std_listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
        std_listener.set_nonblocking(true)?;
        let port = std_listener.local_addr()?.port();
        std::fs::write(endpoint, port.to_string())?;
        let inner = tokio::net::TcpListener::from_std(std_listener)?;
        Ok(Listener { inner })
    }
}

impl Listener {
    pub async fn accept(&self) -> io::Result<Stream> {
        let (stream, _) = self.inner.accept().await?;
        Ok(stream)
    }
}

pub async fn connect(endpoint: &Path) -> io::Result<Stream> {
    #[cfg(unix)]
    {
        tokio::net::UnixStream::connect(endpoint).await
    }

    #[cfg(not(unix))]
    {
        let raw = std::fs::read_to_string(endpoint)?;
        let port: u16 = raw
            .trim()
            .parse()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        tokio::net::TcpStream::connect(("127.0.0.1", port)).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn bound_endpoint_is_private_and_reachable() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = dir.path().join("rack.sock");
        let listener = bind(&endpoint).unwrap();
        let mode = std::fs::metadata(&endpoint).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let server = tokio::spawn(async move {
            let mut stream = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });
        let mut client = connect(&endpoint).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        assert_eq!(&server.await.unwrap(), b"ping");
    }
}
