use std::net::IpAddr;

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue, HOST};
use http::{HeaderMap, Method, Uri};

use crate::ConnexResult;
use crate::error::ConnexError;
use crate::partition::explicit_port;

/// An HTTP proxy endpoint. Proxy *selection* is the caller's concern;
/// the core only needs the endpoint to connect to and to key pool
/// partitions with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Proxy {
    host: String,
    port: u16,
}

impl Proxy {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

/// Immutable request descriptor consumed by the execution layer.
///
/// This is deliberately the narrow subset the lifecycle core needs:
/// enough to connect (uri, proxy, local bind address), to key a pool
/// partition (virtual host) and to rebuild the request on redirect or
/// authentication replay.
#[derive(Clone, Debug)]
pub struct Request {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Option<Bytes>,
    virtual_host: Option<String>,
    proxy: Option<Proxy>,
    local_address: Option<IpAddr>,
    follow_redirect: Option<bool>,
}

impl Request {
    pub fn builder(method: Method, uri: &str) -> RequestBuilder {
        RequestBuilder {
            method,
            uri: uri.to_owned(),
            headers: HeaderMap::new(),
            body: None,
            virtual_host: None,
            proxy: None,
            local_address: None,
            follow_redirect: None,
        }
    }

    pub fn get(uri: &str) -> RequestBuilder {
        Self::builder(Method::GET, uri)
    }

    pub fn post(uri: &str) -> RequestBuilder {
        Self::builder(Method::POST, uri)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn virtual_host(&self) -> Option<&str> {
        self.virtual_host.as_deref()
    }

    pub fn proxy(&self) -> Option<&Proxy> {
        self.proxy.as_ref()
    }

    pub fn local_address(&self) -> Option<IpAddr> {
        self.local_address
    }

    /// Per-request override of the client-level `follow_redirect`.
    pub fn follow_redirect(&self) -> Option<bool> {
        self.follow_redirect
    }

    pub fn is_secured(&self) -> bool {
        matches!(self.uri.scheme_str(), Some("https") | Some("wss"))
    }

    pub(crate) fn into_parts(self) -> RequestParts {
        RequestParts {
            method: self.method,
            uri: self.uri,
            headers: self.headers,
            body: self.body,
            virtual_host: self.virtual_host,
            proxy: self.proxy,
            local_address: self.local_address,
            follow_redirect: self.follow_redirect,
        }
    }

    pub(crate) fn from_parts(parts: RequestParts) -> Self {
        Self {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body: parts.body,
            virtual_host: parts.virtual_host,
            proxy: parts.proxy,
            local_address: parts.local_address,
            follow_redirect: parts.follow_redirect,
        }
    }

    /// The `CONNECT` request that opens a tunnel towards this request's
    /// target through its proxy.
    pub(crate) fn connect_request(&self) -> Self {
        let authority = format!(
            "{}:{}",
            self.uri.host().unwrap_or_default(),
            explicit_port(&self.uri)
        );
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&authority) {
            headers.insert(HOST, value);
        }
        Self {
            method: Method::CONNECT,
            uri: self.uri.clone(),
            headers,
            body: None,
            virtual_host: self.virtual_host.clone(),
            proxy: self.proxy.clone(),
            local_address: self.local_address,
            follow_redirect: self.follow_redirect,
        }
    }
}

/// Owned, mutable decomposition of a [`Request`], used when the
/// intercept layer rebuilds a request for redirect or auth replay.
pub(crate) struct RequestParts {
    pub(crate) method: Method,
    pub(crate) uri: Uri,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Option<Bytes>,
    pub(crate) virtual_host: Option<String>,
    pub(crate) proxy: Option<Proxy>,
    pub(crate) local_address: Option<IpAddr>,
    pub(crate) follow_redirect: Option<bool>,
}

#[derive(Debug)]
pub struct RequestBuilder {
    method: Method,
    uri: String,
    headers: HeaderMap,
    body: Option<Bytes>,
    virtual_host: Option<String>,
    proxy: Option<Proxy>,
    local_address: Option<IpAddr>,
    follow_redirect: Option<bool>,
}

impl RequestBuilder {
    pub fn header(mut self, name: &str, value: &str) -> ConnexResult<Self> {
        let name: HeaderName =
            name.parse()
                .map_err(|source| ConnexError::InvalidHeaderName {
                    name: name.to_owned(),
                    source,
                })?;
        let value: HeaderValue =
            value
                .parse()
                .map_err(|source| ConnexError::InvalidHeaderValue {
                    name: name.to_string(),
                    source,
                })?;
        self.headers.append(name, value);
        Ok(self)
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn virtual_host(mut self, virtual_host: impl Into<String>) -> Self {
        self.virtual_host = Some(virtual_host.into());
        self
    }

    pub fn proxy(mut self, proxy: Proxy) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn local_address(mut self, address: IpAddr) -> Self {
        self.local_address = Some(address);
        self
    }

    pub fn follow_redirect(mut self, follow: bool) -> Self {
        self.follow_redirect = Some(follow);
        self
    }

    pub fn build(self) -> ConnexResult<Request> {
        let uri: Uri = self.uri.parse().map_err(|_| ConnexError::InvalidUri {
            uri: self.uri.clone(),
        })?;
        if uri.host().is_none() {
            return Err(ConnexError::InvalidUri { uri: self.uri });
        }
        Ok(Request {
            method: self.method,
            uri,
            headers: self.headers,
            body: self.body,
            virtual_host: self.virtual_host,
            proxy: self.proxy,
            local_address: self.local_address,
            follow_redirect: self.follow_redirect,
        })
    }
}

/// The "request bytes in" boundary: turns a [`Request`] head into the
/// bytes written to the channel. Body bytes are written separately so
/// the 100-continue flow can defer them.
pub trait RequestCodec: Send + Sync {
    fn encode_head(&self, request: &Request) -> Bytes;
}

/// Minimal HTTP/1.1 head encoder. `CONNECT` uses authority-form, a
/// proxied plaintext request uses absolute-form, everything else
/// origin-form.
pub(crate) struct Http1Codec;

impl RequestCodec for Http1Codec {
    fn encode_head(&self, request: &Request) -> Bytes {
        let uri = request.uri();
        let authority = format!(
            "{}:{}",
            uri.host().unwrap_or_default(),
            explicit_port(uri)
        );
        let target = if request.method() == Method::CONNECT {
            authority.clone()
        } else if request.proxy().is_some() && !request.is_secured() {
            uri.to_string()
        } else {
            uri.path_and_query()
                .map(|value| value.as_str().to_owned())
                .unwrap_or_else(|| "/".to_owned())
        };

        let mut head = BytesMut::with_capacity(256);
        head.put_slice(request.method().as_str().as_bytes());
        head.put_u8(b' ');
        head.put_slice(target.as_bytes());
        head.put_slice(b" HTTP/1.1\r\n");

        if !request.headers().contains_key(HOST) {
            let host = request.virtual_host().map(str::to_owned).unwrap_or(authority);
            head.put_slice(b"host: ");
            head.put_slice(host.as_bytes());
            head.put_slice(b"\r\n");
        }
        for (name, value) in request.headers() {
            head.put_slice(name.as_str().as_bytes());
            head.put_slice(b": ");
            head.put_slice(value.as_bytes());
            head.put_slice(b"\r\n");
        }
        if let Some(body) = request.body() {
            head.put_slice(format!("content-length: {}\r\n", body.len()).as_bytes());
        }
        head.put_slice(b"\r\n");
        head.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_rejects_uri_without_host() {
        let error = Request::get("/relative/only").build().unwrap_err();
        assert_eq!(error.code(), crate::ConnexErrorCode::InvalidUri);
    }

    #[test]
    fn connect_request_targets_authority() {
        let request = Request::get("https://example.com/a/b")
            .proxy(Proxy::new("proxy.local", 3128))
            .build()
            .expect("request");
        let connect = request.connect_request();
        assert_eq!(connect.method(), Method::CONNECT);
        assert!(connect.body().is_none());
        assert_eq!(
            connect.headers().get(HOST).and_then(|v| v.to_str().ok()),
            Some("example.com:443")
        );
    }

    #[test]
    fn http1_codec_renders_origin_form_with_content_length() {
        let request = Request::post("http://example.com/items?x=1")
            .body(Bytes::from_static(b"{}"))
            .build()
            .expect("request");
        let head = Http1Codec.encode_head(&request);
        let text = std::str::from_utf8(&head).expect("utf8 head");
        assert!(text.starts_with("POST /items?x=1 HTTP/1.1\r\n"));
        assert!(text.contains("host: example.com:80\r\n"));
        assert!(text.contains("content-length: 2\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn http1_codec_uses_absolute_form_through_plaintext_proxy() {
        let request = Request::get("http://example.com/x")
            .proxy(Proxy::new("proxy.local", 3128))
            .build()
            .expect("request");
        let head = Http1Codec.encode_head(&request);
        let text = std::str::from_utf8(&head).expect("utf8 head");
        assert!(text.starts_with("GET http://example.com/x HTTP/1.1\r\n"));
    }
}
