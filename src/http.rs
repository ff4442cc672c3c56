//! The persistent-connection HTTP/1.1 client.
use std::fmt::Write as _;
use std::rc::Rc;
use std::cell::RefCell;
use std::time::Duration;

use hyper::http::Method;

pub use hyper::body::Bytes;

use crate::compose::{self, Task};
use crate::config::{self, ClientConfig};
use crate::error::{Error, ProtocolError, Result};
use crate::framing::{self, StatusAndHeaders};
use crate::net::{ConnectSettings, Connection};
use crate::pool::{ConnectionPool, SocketPool};
use crate::reactor::Reactor;
use crate::suspend::Suspend;

/// A status line plus headers, and the body.
pub type Response = (StatusAndHeaders, Bytes);

/// A request to send with [`HttpRequest1_1`].
///
/// ```rust
/// # use ferrule::Request;
/// use std::time::Duration;
///
/// let request = Request::post("example.org", 80, "/submit")
///     .header("Content-Type", "text/plain")
///     .body("Hello world!")
///     .timeout(Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    pub host: String,
    pub port: u16,
    /// Path and query; an empty target is sent as `/`
    pub target: String,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub secure: bool,
    /// Deadline for the whole exchange, retry included
    pub timeout: Option<Duration>,
    pub prio: Option<u8>,
    /// Cut the response body after this many bytes and close the connection
    pub body_max_size: Option<usize>,
}

impl Request {
    pub fn new(method: Method, host: impl Into<String>, port: u16, target: impl Into<String>) -> Self {
        Request {
            host: host.into(),
            port,
            target: target.into(),
            method,
            headers: Vec::new(),
            body: None,
            secure: false,
            timeout: None,
            prio: None,
            body_max_size: None,
        }
    }

    pub fn get(host: impl Into<String>, port: u16, target: impl Into<String>) -> Self {
        Self::new(Method::GET, host, port, target)
    }

    pub fn post(host: impl Into<String>, port: u16, target: impl Into<String>) -> Self {
        Self::new(Method::POST, host, port, target)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Connect with TLS.
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn prio(mut self, prio: u8) -> Self {
        self.prio = Some(prio);
        self
    }

    pub fn body_max_size(mut self, max: usize) -> Self {
        self.body_max_size = Some(max);
        self
    }

    fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Request line and headers, ending with the blank line.
    fn encode_head(&self) -> Vec<u8> {
        let target = if self.target.is_empty() { "/" } else { self.target.as_str() };
        let body_len = self.body.as_ref().map(Bytes::len).filter(|len| *len > 0);

        let mut head = String::new();
        let _ = write!(head, "{} {} HTTP/1.1\r\n", self.method, target);
        if !self.has_header("host") {
            let _ = write!(head, "Host: {}\r\n", self.host);
        }
        for (name, value) in &self.headers {
            if body_len.is_some() && name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            let _ = write!(head, "{}: {}\r\n", name, value);
        }
        if let Some(len) = body_len {
            let _ = write!(head, "Content-Length: {}\r\n", len);
        }
        head.push_str("\r\n");
        head.into_bytes()
    }
}

/// Settings shared by all requests of one client.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub connect: ConnectSettings,
    pub max_head_size: usize,
    /// Used when a request carries no timeout of its own
    pub default_timeout: Option<Duration>,
}

impl HttpSettings {
    pub fn new() -> Result<Self> {
        Ok(HttpSettings {
            connect: ConnectSettings::new()?,
            max_head_size: config::DEFAULT_MAX_HEAD_SIZE,
            default_timeout: None,
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        Ok(HttpSettings {
            connect: ConnectSettings::from_config(config)?,
            max_head_size: config.max_head_size,
            default_timeout: config.request_timeout(),
        })
    }
}

/// HTTP/1.1 client reusing connections through a [`ConnectionPool`].
///
/// A connection taken from the pool may have been closed by the peer while
/// it sat idle. When such a connection fails before any response byte
/// arrived, the request is sent once more on a fresh connection; after the
/// first response byte, failures are reported as they are.
///
/// ```rust,no_run
/// use ferrule::{HttpRequest1_1, PoolLimits, Reactor, Request, SocketPool};
/// use std::rc::Rc;
///
/// let reactor = Reactor::new().unwrap();
/// let pool = Rc::new(SocketPool::new(PoolLimits::default()));
/// let client = HttpRequest1_1::new(&reactor, pool).unwrap();
///
/// let (head, body) = reactor
///     .block_on(async move { client.httprequest1_1(Request::get("example.org", 80, "/")).await })
///     .unwrap()
///     .unwrap();
/// println!("{} {:?}", head.status_code, body);
/// ```
#[derive(Clone)]
pub struct HttpRequest1_1 {
    reactor: Reactor,
    pool: Rc<dyn ConnectionPool<Connection>>,
    settings: Rc<HttpSettings>,
}

impl HttpRequest1_1 {
    pub fn new(reactor: &Reactor, pool: Rc<dyn ConnectionPool<Connection>>) -> Result<Self> {
        Ok(Self::with_settings(reactor, pool, HttpSettings::new()?))
    }

    pub fn with_settings(reactor: &Reactor, pool: Rc<dyn ConnectionPool<Connection>>, settings: HttpSettings) -> Self {
        HttpRequest1_1 {
            reactor: reactor.clone(),
            pool,
            settings: Rc::new(settings),
        }
    }

    /// A client with its own [`SocketPool`], sized and swept as configured.
    pub fn from_config(reactor: &Reactor, config: &ClientConfig) -> Result<Self> {
        let pool = match config.unused_timeout() {
            Some(timeout) => SocketPool::with_unused_timeout(reactor, config.pool_limits(), timeout),
            None => SocketPool::new(config.pool_limits()),
        };
        Ok(Self::with_settings(reactor, Rc::new(pool), HttpSettings::from_config(config)?))
    }

    /// Performs one request/response exchange.
    ///
    /// # Errors
    /// - `Error::Timeout` when the exchange, retry included, outlives the
    ///   timeout; the connection in use is closed first
    /// - `Error::Connect` / `Error::Handshake` for a new connection
    /// - `Error::Framing` / `Error::Protocol` for responses that cannot be
    ///   delimited or followed
    pub async fn httprequest1_1(&self, request: Request) -> Result<Response> {
        let timeout = request.timeout.or(self.settings.default_timeout);
        let prio = request.prio;
        let exchange = Exchange {
            reactor: self.reactor.clone(),
            pool: self.pool.clone(),
            settings: self.settings.clone(),
            request,
        };

        let running: Rc<RefCell<Option<Task<()>>>> = Rc::new(RefCell::new(None));
        let slot = running.clone();
        let reactor = self.reactor.clone();
        let do_next = move |suspend: &Suspend<Response>| -> Result<()> {
            let suspend = suspend.clone();
            let task = compose::spawn_with_prio(
                &reactor,
                async move {
                    let settled = match exchange.run().await {
                        Ok(response) => suspend.resume(response),
                        Err(err) => suspend.throw(err),
                    };
                    if let Err(err) = settled {
                        log::debug!("exchange finished after settlement: {}", err);
                    }
                },
                prio,
            )?;
            *slot.borrow_mut() = Some(task);
            Ok(())
        };

        let suspend = match timeout {
            Some(timeout) => Suspend::with_timeout(do_next, timeout, move || {
                // Dropping the exchange closes its connection.
                if let Some(task) = running.borrow_mut().take() {
                    task.abort();
                }
                Ok(())
            }),
            None => Suspend::new(do_next),
        };
        suspend.wait(&self.reactor).await
    }

    /// Performs the exchange and returns the whole response as bytes:
    /// status line, headers sorted by name, blank line, body.
    pub async fn request_raw(&self, request: Request) -> Result<Bytes> {
        let (head, body) = self.httprequest1_1(request).await?;
        let mut raw = String::new();
        let _ = write!(
            raw,
            "HTTP/{} {} {}\r\n",
            head.http_version,
            head.status_code.as_u16(),
            head.reason_phrase
        );
        for (name, value) in &head.headers {
            let _ = write!(raw, "{}: {}\r\n", name, value);
        }
        raw.push_str("\r\n");

        let mut bytes = raw.into_bytes();
        bytes.extend_from_slice(&body);
        Ok(Bytes::from(bytes))
    }
}

/// One request in flight: owns its connection until it is pooled or closed.
struct Exchange {
    reactor: Reactor,
    pool: Rc<dyn ConnectionPool<Connection>>,
    settings: Rc<HttpSettings>,
    request: Request,
}

impl Exchange {
    async fn run(self) -> Result<Response> {
        if self.request.method == Method::CONNECT {
            return Err(ProtocolError::ConnectMethod.into());
        }
        let (host, port) = (self.request.host.as_str(), self.request.port);

        let mut pooled = self.pool.get_pooled_socket(host, port).await.map(|mut conn| {
            conn.mark_reused();
            conn
        });
        let mut retry_once = pooled.is_some();

        loop {
            let mut conn = match pooled.take() {
                Some(conn) => conn,
                None => {
                    Connection::connect(
                        &self.reactor,
                        host,
                        port,
                        self.request.secure,
                        &self.settings.connect,
                        self.request.prio,
                    )
                    .await?
                }
            };

            match self.attempt(&mut conn).await {
                Ok((head, body, close)) => {
                    if close {
                        conn.shutdown_and_close();
                    } else {
                        self.pool.put_socket_in_pool(host, port, conn).await;
                    }
                    return Ok((head, body));
                }
                Err(err) if retry_once && !conn.received_data() && err.is_retryable() => {
                    log::warn!(
                        "Error when reusing socket for {}:{}. Trying again with a new connection. Error was: {}",
                        host,
                        port,
                        err
                    );
                    conn.shutdown_and_close();
                    retry_once = false;
                }
                Err(err) => {
                    conn.shutdown_and_close();
                    return Err(err);
                }
            }
        }
    }

    /// Sends the request and reads the response on `conn`. The flag tells
    /// whether the connection must be closed afterwards.
    async fn attempt(&self, conn: &mut Connection) -> Result<(StatusAndHeaders, Bytes, bool)> {
        let request = &self.request;
        conn.send_all(&request.encode_head()).await?;
        if let Some(body) = request.body.as_ref().filter(|body| !body.is_empty()) {
            conn.send_all(body).await?;
        }

        let (head, rest) = framing::read_head(conn, Vec::new(), self.settings.max_head_size).await?;
        let (body_framing, close) = framing::determine_framing(&head, &request.method, &request.headers)?;
        let (body, truncated) = framing::read_body(conn, body_framing, rest, request.body_max_size).await?;
        Ok((head, body, close || truncated))
    }
}
