// Copyright 2024 Cloudflare, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Request/response types and the wire sessions that carry them

pub mod http1;

pub use http1::Http1Session;

use async_trait::async_trait;
use bytes::Bytes;
use conduit_error::{Error, ErrorType::*, OrErr, Result};
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};

/// The abstraction of transport layer IO
pub trait IO: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> IO for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// The type of any established transport
pub type Stream = Box<dyn IO>;

/// One connection able to run request/response exchanges, one at a time.
///
/// This is the resource pooled by the dispatcher.
#[async_trait]
pub trait Session: Send + 'static {
    /// Encode and send the request.
    ///
    /// Headers that cannot be put on the wire fail with `EncodingError` before anything is sent.
    async fn write_request(&mut self, req: &Request) -> Result<()>;

    /// Read the response head, failing with `HeaderTooLarge` past `max_header_size` bytes.
    async fn read_response_header(&mut self, max_header_size: usize) -> Result<ResponseHeader>;

    /// Read the next piece of the response body, `None` once it is complete.
    async fn read_body(&mut self) -> Result<Option<Bytes>>;

    /// Whether the last exchange left the connection clean enough for another one
    fn reusable(&self) -> bool;

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Gracefully close the underlying connection
    async fn shutdown(&mut self) {}
}

/// An outbound request
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    /// Header pairs as given by the caller. They are only validated when encoded.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Request {
    pub fn new(method: Method, uri: Uri) -> Self {
        Request {
            method,
            uri,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn get(uri: Uri) -> Self {
        Self::new(Method::GET, uri)
    }

    pub fn post(uri: Uri, body: impl Into<Bytes>) -> Self {
        Self::new(Method::POST, uri).body(body)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// The request target written on the request line
    pub fn path_and_query(&self) -> &str {
        self.uri.path_and_query().map_or("/", |p| p.as_str())
    }

    fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }
}

/// A parsed response head
#[derive(Debug, Clone)]
pub struct ResponseHeader {
    pub status: StatusCode,
    pub version: Version,
    pub reason: Option<String>,
    pub headers: HeaderMap,
}

impl ResponseHeader {
    /// The declared body length, `InvalidHeader` when it is not a number
    pub fn content_length(&self) -> Result<Option<usize>> {
        let Some(value) = self.headers.get(http::header::CONTENT_LENGTH) else {
            return Ok(None);
        };
        let value = value
            .to_str()
            .or_err(InvalidHeader, "non ascii Content-Length")?;
        match value.trim().parse::<usize>() {
            Ok(len) => Ok(Some(len)),
            Err(e) => Error::e_because(
                InvalidHeader,
                format!("invalid Content-Length {value:?}"),
                e,
            ),
        }
    }

    fn has_token(&self, name: http::header::HeaderName, token: &str) -> bool {
        self.headers.get_all(name).iter().any(|v| {
            v.to_str().map_or(false, |v| {
                v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token))
            })
        })
    }
}

/// A complete response
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// The address the request was actually sent to
    pub remote_addr: Option<SocketAddr>,
}

impl Response {
    pub fn new(header: ResponseHeader, body: Bytes) -> Self {
        Response {
            status: header.status,
            version: header.version,
            headers: header.headers,
            body,
            remote_addr: None,
        }
    }
}
