//! Non-blocking client connections driven by the [`Reactor`].
//!
//! A [`Connection`] is a mio TCP stream, optionally wrapped in rustls. Reads
//! and writes are attempted first; on `WouldBlock` the task waits for the
//! matching readiness and tries again.
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hyper::body::Bytes;
use mio::net::TcpStream;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};

use crate::config;
use crate::error::{Error, Result};
use crate::framing::ByteSource;
use crate::pool::Poolable;
use crate::reactor::Reactor;

/// TCP keep-alive probing applied to new connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlive {
    pub idle: Duration,
    pub interval: Duration,
    pub count: u32,
}

impl Default for KeepAlive {
    fn default() -> Self {
        KeepAlive {
            idle: Duration::from_secs(600),
            interval: Duration::from_secs(75),
            count: 9,
        }
    }
}

/// How new connections are opened.
#[derive(Debug, Clone)]
pub struct ConnectSettings {
    pub tls: Arc<ClientConfig>,
    /// Upper bound on handshake I/O rounds before giving up
    pub handshake_retries: u32,
    pub recv_buffer_size: usize,
    pub keepalive: KeepAlive,
}

impl ConnectSettings {
    /// Defaults with the bundled web PKI trust anchors.
    pub fn new() -> Result<Self> {
        Ok(ConnectSettings {
            tls: default_tls_config()?,
            handshake_retries: config::DEFAULT_HANDSHAKE_RETRIES,
            recv_buffer_size: config::DEFAULT_RECV_BUFFER_SIZE,
            keepalive: KeepAlive::default(),
        })
    }

    pub fn from_config(config: &config::ClientConfig) -> Result<Self> {
        Ok(ConnectSettings {
            tls: default_tls_config()?,
            handshake_retries: config.handshake_retries,
            recv_buffer_size: config.recv_buffer_size.max(1),
            keepalive: config.keepalive(),
        })
    }
}

/// rustls client configuration using the ring provider and webpki roots.
pub fn default_tls_config() -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Handshake(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

enum Stream {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Stream {
    fn tcp(&self) -> &TcpStream {
        match self {
            Stream::Plain(sock) => sock,
            Stream::Tls(tls) => &tls.sock,
        }
    }

    fn is_tls(&self) -> bool {
        matches!(self, Stream::Tls(_))
    }

    fn shutdown(&mut self) -> io::Result<()> {
        if let Stream::Tls(tls) = self {
            tls.conn.send_close_notify();
            let _ = tls.conn.write_tls(&mut tls.sock);
        }
        self.tcp().shutdown(Shutdown::Both)
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(sock) => sock.read(buf),
            Stream::Tls(tls) => tls.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(sock) => sock.write(buf),
            Stream::Tls(tls) => tls.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Plain(sock) => sock.flush(),
            Stream::Tls(tls) => tls.flush(),
        }
    }
}

fn closed() -> Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection already closed").into()
}

/// A client connection owned by one request at a time.
pub struct Connection {
    stream: Option<Stream>,
    reactor: Reactor,
    prio: Option<u8>,
    recv_buffer_size: usize,
    received_data: bool,
}

impl Connection {
    /// Connects to `host:port`, then performs the TLS handshake when `secure`.
    ///
    /// # Errors
    /// - `Error::Connect` for resolution failures, refused connections or a
    ///   pending socket error after connect
    /// - `Error::Handshake` when TLS negotiation fails
    pub async fn connect(
        reactor: &Reactor,
        host: &str,
        port: u16,
        secure: bool,
        settings: &ConnectSettings,
        prio: Option<u8>,
    ) -> Result<Connection> {
        let addr = resolve(host, port)?;
        let sock = TcpStream::connect(addr).map_err(Error::connect)?;

        loop {
            reactor.writable(&sock, prio).await?;
            if let Some(err) = sock.take_error().map_err(Error::connect)? {
                return Err(Error::connect(err));
            }
            match sock.peer_addr() {
                Ok(_) => break,
                Err(err) if err.kind() == io::ErrorKind::NotConnected => continue,
                Err(err) => return Err(Error::connect(err)),
            }
        }

        if let Err(err) = sock.set_nodelay(true) {
            log::debug!("TCP_NODELAY on {}:{} failed: {}", host, port, err);
        }
        if let Err(err) = set_keepalive(sock.as_raw_fd(), &settings.keepalive) {
            log::debug!("keep-alive on {}:{} failed: {}", host, port, err);
        }

        let stream = if secure {
            Stream::Tls(Box::new(handshake(reactor, sock, host, settings, prio).await?))
        } else {
            Stream::Plain(sock)
        };

        Ok(Connection {
            stream: Some(stream),
            reactor: reactor.clone(),
            prio,
            recv_buffer_size: settings.recv_buffer_size,
            received_data: false,
        })
    }

    /// Receives the next fragment, `None` once the peer closed.
    pub async fn recv(&mut self) -> Result<Option<Bytes>> {
        let mut buf = vec![0u8; self.recv_buffer_size];
        loop {
            let stream = self.stream.as_mut().ok_or_else(closed)?;
            match stream.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(n) => {
                    self.received_data = true;
                    buf.truncate(n);
                    return Ok(Some(Bytes::from(buf)));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    let fd = stream.tcp().as_raw_fd();
                    self.reactor.readable(&fd, self.prio).await?;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                // Peer closed without close_notify.
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof && stream.is_tls() => {
                    return Ok(None)
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Writes all of `data`, waiting for writability as needed.
    pub async fn send_all(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let stream = self.stream.as_mut().ok_or_else(closed)?;
            match stream.write(data) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => data = &data[n..],
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    let fd = stream.tcp().as_raw_fd();
                    self.reactor.writable(&fd, self.prio).await?;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        self.flush().await
    }

    async fn flush(&mut self) -> Result<()> {
        loop {
            let stream = self.stream.as_mut().ok_or_else(closed)?;
            match stream.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    let fd = stream.tcp().as_raw_fd();
                    self.reactor.writable(&fd, self.prio).await?;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Whether any response byte arrived since connect or the last reuse.
    pub fn received_data(&self) -> bool {
        self.received_data
    }

    /// Prepares a pooled connection for its next request.
    pub(crate) fn mark_reused(&mut self) {
        self.received_data = false;
    }

    pub fn is_secure(&self) -> bool {
        self.stream.as_ref().map_or(false, Stream::is_tls)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        let stream = self.stream.as_ref().ok_or_else(closed)?;
        Ok(stream.tcp().local_addr()?)
    }

    /// Shuts down and closes the socket. Safe to call more than once.
    pub fn shutdown_and_close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(err) = stream.shutdown() {
                log::debug!("shutdown failed: {}", err);
            }
        }
    }
}

impl AsRawFd for Connection {
    /// -1 once closed.
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_ref().map_or(-1, |stream| stream.tcp().as_raw_fd())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown_and_close();
    }
}

impl Poolable for Connection {
    fn shutdown(&mut self) -> io::Result<()> {
        match self.stream.as_mut() {
            Some(stream) => stream.shutdown(),
            None => Ok(()),
        }
    }

    fn close(mut self) {
        self.stream = None;
    }
}

#[async_trait(?Send)]
impl ByteSource for Connection {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        self.recv().await
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(Error::connect)?
        .next()
        .ok_or_else(|| {
            Error::connect(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address found for {}", host),
            ))
        })
}

/// Drives the rustls handshake on a non-blocking socket.
async fn handshake(
    reactor: &Reactor,
    sock: TcpStream,
    host: &str,
    settings: &ConnectSettings,
    prio: Option<u8>,
) -> Result<StreamOwned<ClientConnection, TcpStream>> {
    let name = ServerName::try_from(host.to_owned()).map_err(|e| Error::Handshake(e.to_string()))?;
    let conn = ClientConnection::new(settings.tls.clone(), name).map_err(|e| Error::Handshake(e.to_string()))?;
    let mut tls = StreamOwned::new(conn, sock);

    for _ in 0..settings.handshake_retries {
        if !tls.conn.is_handshaking() {
            return Ok(tls);
        }
        match tls.conn.complete_io(&mut tls.sock) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                if tls.conn.wants_write() {
                    reactor.writable(&tls.sock, prio).await?;
                } else {
                    reactor.readable(&tls.sock, prio).await?;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(Error::Handshake(err.to_string())),
        }
    }

    if tls.conn.is_handshaking() {
        return Err(Error::Handshake(format!(
            "not completed after {} attempts",
            settings.handshake_retries
        )));
    }
    Ok(tls)
}

fn setsockopt(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
    // SAFETY: `value` outlives the call and the length matches its type.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_keepalive(fd: RawFd, keepalive: &KeepAlive) -> io::Result<()> {
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1)?;
    #[cfg(target_os = "linux")]
    {
        setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, keepalive.idle.as_secs() as libc::c_int)?;
        setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPINTVL, keepalive.interval.as_secs() as libc::c_int)?;
        setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPCNT, keepalive.count as libc::c_int)?;
    }
    #[cfg(not(target_os = "linux"))]
    let _ = keepalive;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn settings() -> ConnectSettings {
        ConnectSettings::new().unwrap()
    }

    fn getsockopt(fd: RawFd, level: libc::c_int, name: libc::c_int) -> libc::c_int {
        let mut value: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(fd, level, name, &mut value as *mut libc::c_int as *mut libc::c_void, &mut len)
        };
        assert_eq!(ret, 0);
        value
    }

    #[test]
    fn test_tls_config_builds() {
        assert!(default_tls_config().is_ok());
    }

    /// Tests a plain exchange with a std echo-style server thread.
    #[test]
    fn test_connect_send_recv() {
        let reactor = Reactor::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 13];
            stream.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"Hello, World!");
            stream.write_all(b"Response!").unwrap();
        });

        let r = reactor.clone();
        let received = reactor
            .block_on(async move {
                let mut conn = Connection::connect(&r, "127.0.0.1", port, false, &settings(), None).await?;
                assert!(!conn.received_data());
                conn.send_all(b"Hello, World!").await?;

                let mut received = Vec::new();
                while let Some(chunk) = conn.recv().await? {
                    received.extend_from_slice(&chunk);
                }
                assert!(conn.received_data());
                Ok::<_, Error>(received)
            })
            .unwrap()
            .unwrap();

        assert_eq!(received, b"Response!");
        server.join().unwrap();
        assert!(reactor.is_idle());
    }

    #[test]
    fn test_socket_options() {
        let reactor = Reactor::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let r = reactor.clone();
        let conn = reactor
            .block_on(async move { Connection::connect(&r, "127.0.0.1", port, false, &settings(), None).await })
            .unwrap()
            .unwrap();

        let fd = conn.as_raw_fd();
        assert_ne!(getsockopt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY), 0);
        assert_ne!(getsockopt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE), 0);
        #[cfg(target_os = "linux")]
        {
            assert_eq!(getsockopt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE), 600);
            assert_eq!(getsockopt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPINTVL), 75);
            assert_eq!(getsockopt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPCNT), 9);
        }
        drop(listener);
    }

    #[test]
    fn test_connection_refused() {
        let reactor = Reactor::new().unwrap();
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let r = reactor.clone();
        let result = reactor
            .block_on(async move { Connection::connect(&r, "127.0.0.1", port, false, &settings(), None).await })
            .unwrap();
        assert!(matches!(result, Err(Error::Connect(_))));
        assert!(reactor.is_idle());
    }

    #[test]
    fn test_unresolvable_host() {
        let reactor = Reactor::new().unwrap();
        let r = reactor.clone();
        let result = reactor
            .block_on(async move { Connection::connect(&r, "host.invalid", 80, false, &settings(), None).await })
            .unwrap();
        assert!(matches!(result, Err(Error::Connect(_))));
    }

    /// A peer that does not speak TLS fails the handshake.
    #[test]
    fn test_handshake_failure() {
        let reactor = Reactor::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let _ = stream.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n");
        });

        let r = reactor.clone();
        let result = reactor
            .block_on(async move { Connection::connect(&r, "127.0.0.1", port, true, &settings(), None).await })
            .unwrap();
        assert!(matches!(result, Err(Error::Handshake(_))));
    }

    /// Closing twice is harmless and the peer sees end-of-stream.
    #[test]
    fn test_shutdown_and_close_is_idempotent() {
        let reactor = Reactor::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let r = reactor.clone();
        let mut conn = reactor
            .block_on(async move { Connection::connect(&r, "127.0.0.1", port, false, &settings(), None).await })
            .unwrap()
            .unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        conn.shutdown_and_close();
        conn.shutdown_and_close();
        assert_eq!(conn.as_raw_fd(), -1);
        assert!(conn.local_addr().is_err());

        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).unwrap(), 0);
    }
}
