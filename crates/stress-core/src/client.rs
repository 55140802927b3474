//! Reusable, traced HTTP client of one step.
//!
//! Connections are opened with hyper's low-level `client::conn` API so the
//! tracer can see every phase: name resolution, TCP connect, optional proxy
//! tunnel, TLS handshake (certificate verification disabled), and the HTTP
//! handshake. HTTP/1.1 connections are pooled per authority when keep-alive
//! is on; an HTTP/2 connection negotiated through ALPN is shared by all
//! workers. With compression on, gzip is requested and decoded.

use bytes::Bytes;
use flate2::read::GzDecoder;
use http::header::{
    ACCEPT_ENCODING, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HOST, LOCATION,
};
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri, Version};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::client::conn::{http1, http2};
use hyper::upgrade::Upgraded;
use hyper_util::rt::{TokioExecutor, TokioIo};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{self, Read};
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;
use url::{Host, Url};

use crate::error::RequestError;
use crate::hooks::ResponseHandle;
use crate::tracer::{Phases, Trace, TracedStream, WireMarks};

const MAX_REDIRECTS: usize = 10;
const MAX_IDLE_PER_HOST: usize = 1024;

/// Transport policy of a step's client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientSettings {
    pub proxy: Option<Url>,
    pub h2: bool,
    pub keep_alive: bool,
    pub compression: bool,
    pub follow_redirects: bool,
}

/// Request ready to leave the step, after hooks ran.
#[derive(Debug, Clone)]
pub(crate) struct Outgoing {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Result of one traced request: the phases reached and the response or error.
#[derive(Debug)]
pub(crate) struct Traced {
    pub phases: Phases,
    pub outcome: Result<ResponseHandle, RequestError>,
}

pub(crate) struct StepClient {
    settings: ClientSettings,
    proxy: Option<Endpoint>,
    tls: TlsConnector,
    idle: Mutex<HashMap<String, Vec<Idle>>>,
    shared: Mutex<HashMap<String, Shared>>,
}

impl StepClient {
    pub(crate) fn new(settings: ClientSettings) -> Result<Self, RequestError> {
        let proxy = settings
            .proxy
            .as_ref()
            .map(Endpoint::from_url)
            .transpose()?;
        let tls = danger::insecure_connector(settings.h2)?;
        Ok(Self {
            settings,
            proxy,
            tls,
            idle: Mutex::new(HashMap::new()),
            shared: Mutex::new(HashMap::new()),
        })
    }

    /// Sends `request`, following redirects when allowed, under an optional
    /// overall timeout. Phases reached before a failure are kept.
    pub(crate) async fn execute(&self, request: Outgoing, timeout: Option<Duration>) -> Traced {
        let mut trace = Trace::new();
        let outcome = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.follow(request, &mut trace))
                .await
                .unwrap_or(Err(RequestError::Timeout(limit))),
            None => self.follow(request, &mut trace).await,
        };
        Traced {
            phases: trace.finish(),
            outcome,
        }
    }

    async fn follow(
        &self,
        mut request: Outgoing,
        trace: &mut Trace,
    ) -> Result<ResponseHandle, RequestError> {
        let mut hops = 0;
        loop {
            let response = self.round_trip(&request, trace).await?;
            let Some(next) = self.redirect(&request, &response)? else {
                return Ok(response);
            };
            hops += 1;
            if hops > MAX_REDIRECTS {
                return Err(RequestError::Redirect(format!(
                    "stopped after {MAX_REDIRECTS} redirects"
                )));
            }
            trace.next_hop();
            request = next;
        }
    }

    async fn round_trip(
        &self,
        request: &Outgoing,
        trace: &mut Trace,
    ) -> Result<ResponseHandle, RequestError> {
        let target = Endpoint::from_url(&request.url)?;
        let mut conn = self.acquire(&target, trace).await?;
        let outgoing = self.build(request, &target, conn.multiplexed())?;

        let response = match conn.send(outgoing).await {
            Ok(response) => response,
            // The server may close an idle connection while it sits in the pool.
            Err(e) if conn.reused && conn.replayable(&request.method) => {
                debug!(target = %conn.key, error = %e, "pooled connection failed, redialing");
                conn = self.connect(&target, target.key(), trace).await?;
                let outgoing = self.build(request, &target, conn.multiplexed())?;
                conn.send(outgoing).await?
            }
            Err(e) => return Err(e.into()),
        };
        trace.head_received();
        let (mut parts, body) = response.into_parts();
        // Draining the whole body is what lets the connection go back to the pool.
        let mut body = body.collect().await?.to_bytes();
        trace.body_read();
        self.release(conn);

        if self.decodes(request) && is_gzip(&parts.headers) && !body.is_empty() {
            body = gunzip(&body)?;
            parts.headers.remove(CONTENT_ENCODING);
            parts.headers.remove(CONTENT_LENGTH);
        }

        Ok(ResponseHandle {
            url: request.url.clone(),
            status: parts.status,
            version: parts.version,
            headers: parts.headers,
            body,
        })
    }

    /// Gzip replies are decoded only when the client asked for them itself.
    fn decodes(&self, request: &Outgoing) -> bool {
        self.settings.compression && !request.headers.contains_key(ACCEPT_ENCODING)
    }

    fn redirect(
        &self,
        request: &Outgoing,
        response: &ResponseHandle,
    ) -> Result<Option<Outgoing>, RequestError> {
        if !self.settings.follow_redirects || !is_redirect(response.status) {
            return Ok(None);
        }
        let Some(location) = response
            .headers
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
        else {
            return Ok(None);
        };
        let url = request.url.join(location).map_err(|e| {
            RequestError::Redirect(format!("invalid redirect location {location:?}: {e}"))
        })?;

        let mut next = Outgoing {
            url,
            ..request.clone()
        };
        let status = response.status.as_u16();
        let to_get = (status == 303 && request.method != Method::HEAD)
            || (matches!(status, 301 | 302) && request.method == Method::POST);
        if to_get {
            next.method = Method::GET;
            next.body = Bytes::new();
            next.headers.remove(CONTENT_TYPE);
            next.headers.remove(CONTENT_LENGTH);
        }
        if next.url.host_str() != request.url.host_str() || next.url.port() != request.url.port()
        {
            next.headers.remove(HOST);
        }
        Ok(Some(next))
    }

    async fn acquire(&self, target: &Endpoint, trace: &mut Trace) -> Result<Conn, RequestError> {
        let key = target.key();
        let start = Instant::now();
        if self.settings.keep_alive {
            if let Some(conn) = self.checkout(&key).await {
                trace.connected(start.elapsed(), conn.wire.clone(), conn.multiplexed());
                return Ok(conn);
            }
        }
        self.connect(target, key, trace).await
    }

    async fn checkout(&self, key: &str) -> Option<Conn> {
        {
            let mut shared = self.shared.lock();
            match shared.get(key) {
                Some(conn) if !conn.sender.is_closed() => {
                    return Some(Conn {
                        key: key.to_string(),
                        sender: Sender::Http2(conn.sender.clone()),
                        wire: conn.wire.clone(),
                        reused: true,
                    });
                }
                Some(_) => {
                    shared.remove(key);
                }
                None => {}
            }
        }

        loop {
            let Idle { mut sender, wire } = {
                let mut idle = self.idle.lock();
                idle.get_mut(key).and_then(|list| list.pop())
            }?;
            if sender.is_closed() {
                continue;
            }
            if sender.ready().await.is_ok() {
                return Some(Conn {
                    key: key.to_string(),
                    sender: Sender::Http1(sender),
                    wire,
                    reused: true,
                });
            }
        }
    }

    fn release(&self, conn: Conn) {
        if !self.settings.keep_alive {
            return;
        }
        if let Sender::Http1(sender) = conn.sender {
            let mut idle = self.idle.lock();
            let list = idle.entry(conn.key).or_default();
            if list.len() < MAX_IDLE_PER_HOST {
                list.push(Idle {
                    sender,
                    wire: conn.wire,
                });
            }
        }
    }

    async fn connect(
        &self,
        target: &Endpoint,
        key: String,
        trace: &mut Trace,
    ) -> Result<Conn, RequestError> {
        let dial = self.proxy.as_ref().unwrap_or(target);

        let dns_start = Instant::now();
        let (addrs, looked_up) = resolve(&dial.host, dial.port).await?;
        trace.dns_done(if looked_up {
            dns_start.elapsed()
        } else {
            Duration::ZERO
        });

        let connect_start = Instant::now();
        let tcp = dial_any(&addrs).await?;
        let base = if self.proxy.is_some() && target.tls {
            tunnel(tcp, target).await?
        } else {
            Transport::Plain(tcp)
        };

        let wire = Arc::new(WireMarks::default());
        let sender = if target.tls {
            let server_name = rustls::pki_types::ServerName::try_from(target.host.clone())
                .map_err(|e| RequestError::Tls(format!("{}: {e}", target.host)))?;
            let stream = self
                .tls
                .connect(server_name, base)
                .await
                .map_err(|e| RequestError::Tls(e.to_string()))?;
            let negotiated_h2 = stream.get_ref().1.alpn_protocol() == Some(b"h2".as_slice());
            handshake(Transport::Tls(Box::new(stream)), wire.clone(), negotiated_h2).await?
        } else {
            handshake(base, wire.clone(), false).await?
        };

        let conn = Conn {
            key,
            sender,
            wire,
            reused: false,
        };
        debug!(
            target = %conn.key,
            h2 = conn.multiplexed(),
            proxied = self.proxy.is_some(),
            "opened connection"
        );
        if let (Sender::Http2(sender), true) = (&conn.sender, self.settings.keep_alive) {
            self.shared.lock().insert(
                conn.key.clone(),
                Shared {
                    sender: sender.clone(),
                    wire: conn.wire.clone(),
                },
            );
        }
        trace.connected(connect_start.elapsed(), conn.wire.clone(), conn.multiplexed());
        Ok(conn)
    }

    fn build(
        &self,
        request: &Outgoing,
        target: &Endpoint,
        multiplexed: bool,
    ) -> Result<Request<Full<Bytes>>, RequestError> {
        let absolute = multiplexed || (self.proxy.is_some() && !target.tls);
        let uri: Uri = if absolute {
            let mut url = request.url.clone();
            url.set_fragment(None);
            url.as_str().parse()
        } else {
            origin_form(&request.url).parse()
        }
        .map_err(|e| RequestError::Http(format!("invalid request target: {e}")))?;

        let mut outgoing = Request::new(Full::new(request.body.clone()));
        *outgoing.method_mut() = request.method.clone();
        *outgoing.uri_mut() = uri;
        *outgoing.headers_mut() = request.headers.clone();
        if multiplexed {
            *outgoing.version_mut() = Version::HTTP_2;
        }

        let headers = outgoing.headers_mut();
        if !multiplexed {
            if !headers.contains_key(HOST) {
                let host = HeaderValue::from_str(&host_header(&request.url))
                    .map_err(|e| RequestError::Http(format!("invalid host: {e}")))?;
                headers.insert(HOST, host);
            }
            if !self.settings.keep_alive {
                headers.insert(CONNECTION, HeaderValue::from_static("close"));
            }
        }
        if !headers.contains_key(ACCEPT_ENCODING) {
            let encoding = if self.settings.compression {
                "gzip"
            } else {
                "identity"
            };
            headers.insert(ACCEPT_ENCODING, HeaderValue::from_static(encoding));
        }
        Ok(outgoing)
    }
}

fn is_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("gzip"))
}

fn gunzip(body: &[u8]) -> Result<Bytes, RequestError> {
    let mut decoded = Vec::with_capacity(body.len() * 4);
    GzDecoder::new(body)
        .read_to_end(&mut decoded)
        .map_err(|e| RequestError::Http(format!("invalid gzip body: {e}")))?;
    Ok(Bytes::from(decoded))
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

fn origin_form(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// Where a connection goes: the target itself or the proxy in front of it.
#[derive(Debug, Clone)]
struct Endpoint {
    tls: bool,
    host: String,
    port: u16,
    authority: String,
}

impl Endpoint {
    fn from_url(url: &Url) -> Result<Self, RequestError> {
        let tls = match url.scheme() {
            "http" => false,
            "https" => true,
            other => {
                return Err(RequestError::Http(format!("unsupported scheme {other:?}")));
            }
        };
        let (host, authority_host) = match url.host() {
            Some(Host::Domain(d)) => (d.to_string(), d.to_string()),
            Some(Host::Ipv4(ip)) => (ip.to_string(), ip.to_string()),
            Some(Host::Ipv6(ip)) => (ip.to_string(), format!("[{ip}]")),
            None => return Err(RequestError::Http(format!("{url} has no host"))),
        };
        let port = url
            .port_or_known_default()
            .ok_or_else(|| RequestError::Http(format!("{url} has no port")))?;
        Ok(Self {
            tls,
            host,
            port,
            authority: format!("{authority_host}:{port}"),
        })
    }

    fn key(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{scheme}://{}", self.authority)
    }
}

async fn resolve(host: &str, port: u16) -> Result<(Vec<SocketAddr>, bool), RequestError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok((vec![SocketAddr::new(ip, port)], false));
    }
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| RequestError::Dns(format!("{host}: {e}")))?
        .collect();
    if addrs.is_empty() {
        return Err(RequestError::Dns(format!("{host}: no addresses found")));
    }
    Ok((addrs, true))
}

async fn dial_any(addrs: &[SocketAddr]) -> Result<TcpStream, RequestError> {
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                return Ok(stream);
            }
            Err(e) => last_err = Some(format!("{addr}: {e}")),
        }
    }
    Err(RequestError::Connect(
        last_err.unwrap_or_else(|| "no address to dial".to_string()),
    ))
}

/// Opens a `CONNECT` tunnel through an HTTP proxy and hands back the
/// upgraded stream, including any bytes the proxy sent past its reply.
async fn tunnel(tcp: TcpStream, target: &Endpoint) -> Result<Transport, RequestError> {
    let proxy_err = |e: hyper::Error| RequestError::Proxy(e.to_string());
    let (mut sender, conn): (http1::SendRequest<Empty<Bytes>>, _) = http1::Builder::new()
        .handshake(TokioIo::new(tcp))
        .await
        .map_err(proxy_err)?;
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!(error = %e, "proxy connection closed");
        }
    });

    let connect = Request::builder()
        .method(Method::CONNECT)
        .uri(target.authority.as_str())
        .header(HOST, target.authority.as_str())
        .body(Empty::new())
        .map_err(|e| RequestError::Proxy(e.to_string()))?;
    let response = sender.send_request(connect).await.map_err(proxy_err)?;
    if !response.status().is_success() {
        return Err(RequestError::Proxy(format!(
            "proxy refused tunnel: {}",
            response.status()
        )));
    }
    let upgraded = hyper::upgrade::on(response).await.map_err(proxy_err)?;
    Ok(Transport::Tunnel(TokioIo::new(upgraded)))
}

async fn handshake(
    transport: Transport,
    wire: Arc<WireMarks>,
    h2: bool,
) -> Result<Sender, RequestError> {
    let io = TokioIo::new(TracedStream::new(transport, wire));
    if h2 {
        let (sender, conn) = http2::Builder::new(TokioExecutor::new())
            .handshake(io)
            .await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "http2 connection closed");
            }
        });
        Ok(Sender::Http2(sender))
    } else {
        let (sender, conn) = http1::Builder::new().handshake(io).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "http1 connection closed");
            }
        });
        Ok(Sender::Http1(sender))
    }
}

enum Sender {
    Http1(http1::SendRequest<Full<Bytes>>),
    Http2(http2::SendRequest<Full<Bytes>>),
}

struct Conn {
    key: String,
    sender: Sender,
    wire: Arc<WireMarks>,
    /// Came out of the pool rather than a fresh dial
    reused: bool,
}

impl Conn {
    fn multiplexed(&self) -> bool {
        matches!(self.sender, Sender::Http2(_))
    }

    /// A failed exchange may be sent again when no reply byte arrived and
    /// repeating the method is harmless.
    fn replayable(&self, method: &Method) -> bool {
        method.is_idempotent() && self.wire.snapshot().first_read.is_none()
    }

    async fn send(&mut self, request: Request<Full<Bytes>>) -> hyper::Result<Response<Incoming>> {
        match &mut self.sender {
            Sender::Http1(sender) => sender.send_request(request).await,
            Sender::Http2(sender) => sender.send_request(request).await,
        }
    }
}

struct Idle {
    sender: http1::SendRequest<Full<Bytes>>,
    wire: Arc<WireMarks>,
}

struct Shared {
    sender: http2::SendRequest<Full<Bytes>>,
    wire: Arc<WireMarks>,
}

enum Transport {
    Plain(TcpStream),
    /// `CONNECT` tunnel through a proxy
    Tunnel(TokioIo<Upgraded>),
    Tls(Box<TlsStream<Transport>>),
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tunnel(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tunnel(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            Transport::Tunnel(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            Transport::Plain(s) => s.is_write_vectored(),
            Transport::Tunnel(s) => s.is_write_vectored(),
            Transport::Tls(s) => s.is_write_vectored(),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_flush(cx),
            Transport::Tunnel(s) => Pin::new(s).poll_flush(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tunnel(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// TLS configuration that skips certificate verification.
mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{ClientConfig, DigitallySignedStruct, Error, SignatureScheme};
    use std::sync::Arc;
    use tokio_rustls::TlsConnector;

    use crate::error::RequestError;

    pub(super) fn insecure_connector(h2: bool) -> Result<TlsConnector, RequestError> {
        let provider = Arc::new(ring::default_provider());
        let mut config = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| RequestError::Tls(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification(provider)))
            .with_no_client_auth();
        config.alpn_protocols = if h2 {
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        } else {
            vec![b"http/1.1".to_vec()]
        };
        Ok(TlsConnector::from(Arc::new(config)))
    }

    #[derive(Debug)]
    struct NoCertificateVerification(Arc<CryptoProvider>);

    impl ServerCertVerifier for NoCertificateVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}
