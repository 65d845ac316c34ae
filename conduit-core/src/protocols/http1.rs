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

//! HTTP/1.1 client session

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use conduit_error::{Error, ErrorType::*, OrErr, Result};
use http::header::{CONNECTION, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use log::{debug, trace};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{Request, ResponseHeader, Session, Stream};

const INIT_HEADER_BUF_SIZE: usize = 4096;
const BODY_READ_SIZE: usize = 16 * 1024;
const MAX_HEADERS: usize = 256;
const CRLF: &[u8; 2] = b"\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chunk {
    Size,
    Data(usize),
    DataEnd,
    Trailers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Body {
    // the response head is not read yet
    Pending,
    Length(usize),
    Chunked(Chunk),
    UntilClose,
    Done,
}

/// An HTTP/1.1 connection to one destination
pub struct Http1Session {
    stream: Stream,
    buf: BytesMut,
    body: Body,
    keepalive: bool,
    head_request: bool,
    peer: Option<SocketAddr>,
}

impl Http1Session {
    pub fn new(stream: Stream) -> Self {
        Http1Session {
            stream,
            buf: BytesMut::with_capacity(INIT_HEADER_BUF_SIZE),
            body: Body::Done,
            keepalive: true,
            head_request: false,
            peer: None,
        }
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    async fn read_more(&mut self) -> Result<usize> {
        if self.buf.capacity() - self.buf.len() < INIT_HEADER_BUF_SIZE {
            self.buf.reserve(BODY_READ_SIZE);
        }
        self.stream
            .read_buf(&mut self.buf)
            .await
            .or_err(ReadError, "while reading response")
    }

    // read at least one more byte or fail
    async fn fill(&mut self, what: &str) -> Result<()> {
        if self.read_more().await? == 0 {
            return Error::e_explain(
                ConnectionClosed,
                format!("peer closed the connection while reading {what}"),
            );
        }
        Ok(())
    }

    async fn read_header_inner(&mut self, max_header_size: usize) -> Result<ResponseHeader> {
        loop {
            if !self.buf.is_empty() {
                let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
                let mut resp = httparse::Response::new(&mut headers);
                let mut parser = httparse::ParserConfig::default();
                parser.allow_spaces_after_header_name_in_responses(true);
                match parser.parse_response(&mut resp, &self.buf) {
                    Ok(httparse::Status::Complete(size)) => {
                        if size > max_header_size {
                            return Error::e_explain(
                                HeaderTooLarge,
                                format!("response header of {size} bytes, limit {max_header_size}"),
                            );
                        }
                        let header = build_header(&resp)?;
                        self.buf.advance(size);
                        // 101 is final, the other 1xx are followed by the real response
                        if header.status.is_informational()
                            && header.status != StatusCode::SWITCHING_PROTOCOLS
                        {
                            debug!("skipping informational response {}", header.status);
                            continue;
                        }
                        self.keepalive = match header.version {
                            Version::HTTP_11 => !header.has_token(CONNECTION, "close"),
                            _ => header.has_token(CONNECTION, "keep-alive"),
                        };
                        self.body = self.body_framing(&header)?;
                        if self.body == Body::UntilClose {
                            self.keepalive = false;
                        }
                        debug!("response header: {header:?}");
                        return Ok(header);
                    }
                    Ok(httparse::Status::Partial) => {
                        if self.buf.len() >= max_header_size {
                            return Error::e_explain(
                                HeaderTooLarge,
                                format!(
                                    "response header exceeds {max_header_size} bytes, {} read",
                                    self.buf.len()
                                ),
                            );
                        }
                    }
                    Err(e) => {
                        return Error::e_because(InvalidHeader, "while parsing response header", e)
                    }
                }
            }
            self.fill("response header").await?;
        }
    }

    async fn read_body_inner(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.body {
                Body::Pending | Body::Done => return Ok(None),
                Body::Length(remaining) => {
                    if self.buf.is_empty() {
                        self.fill("response body").await?;
                    }
                    let n = remaining.min(self.buf.len());
                    self.body = if n == remaining {
                        Body::Done
                    } else {
                        Body::Length(remaining - n)
                    };
                    return Ok(Some(self.buf.split_to(n).freeze()));
                }
                Body::UntilClose => {
                    if self.buf.is_empty() && self.read_more().await? == 0 {
                        self.body = Body::Done;
                        return Ok(None);
                    }
                    return Ok(Some(self.buf.split().freeze()));
                }
                Body::Chunked(Chunk::Size) => match httparse::parse_chunk_size(&self.buf) {
                    Ok(httparse::Status::Complete((consumed, size))) => {
                        self.buf.advance(consumed);
                        self.body = match usize::try_from(size) {
                            Ok(0) => Body::Chunked(Chunk::Trailers),
                            Ok(size) => Body::Chunked(Chunk::Data(size)),
                            Err(e) => return Error::e_because(InvalidBody, "chunk too large", e),
                        };
                    }
                    Ok(httparse::Status::Partial) => self.fill("chunk size").await?,
                    Err(e) => {
                        return Error::e_explain(InvalidBody, format!("invalid chunk size: {e:?}"))
                    }
                },
                Body::Chunked(Chunk::Data(remaining)) => {
                    if self.buf.is_empty() {
                        self.fill("chunk").await?;
                    }
                    let n = remaining.min(self.buf.len());
                    self.body = if n == remaining {
                        Body::Chunked(Chunk::DataEnd)
                    } else {
                        Body::Chunked(Chunk::Data(remaining - n))
                    };
                    return Ok(Some(self.buf.split_to(n).freeze()));
                }
                Body::Chunked(Chunk::DataEnd) => {
                    if self.buf.len() < CRLF.len() {
                        self.fill("chunk end").await?;
                        continue;
                    }
                    if &self.buf[..CRLF.len()] != CRLF {
                        return Error::e_explain(InvalidBody, "chunk not followed by CRLF");
                    }
                    self.buf.advance(CRLF.len());
                    self.body = Body::Chunked(Chunk::Size);
                }
                Body::Chunked(Chunk::Trailers) => {
                    match self.buf.windows(CRLF.len()).position(|w| w == CRLF) {
                        Some(end) => {
                            self.buf.advance(end + CRLF.len());
                            // an empty line ends the trailers
                            if end == 0 {
                                self.body = Body::Done;
                                return Ok(None);
                            }
                        }
                        None => self.fill("chunk trailers").await?,
                    }
                }
            }
        }
    }

    fn body_framing(&self, header: &ResponseHeader) -> Result<Body> {
        let status = header.status;
        if self.head_request
            || status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
        {
            return Ok(Body::Done);
        }
        if header.has_token(TRANSFER_ENCODING, "chunked") {
            return Ok(Body::Chunked(Chunk::Size));
        }
        match header.content_length()? {
            Some(0) => Ok(Body::Done),
            Some(len) => Ok(Body::Length(len)),
            None => Ok(Body::UntilClose),
        }
    }
}

#[async_trait]
impl Session for Http1Session {
    async fn write_request(&mut self, req: &Request) -> Result<()> {
        let wire = encode_request(req).map_err(|e| e.into_local())?;
        trace!("request head and body: {} bytes", wire.len());
        self.head_request = req.method == Method::HEAD;
        self.body = Body::Pending;
        self.stream
            .write_all(&wire)
            .await
            .or_err(WriteError, "while writing request")
            .map_err(|e| e.into_remote())?;
        self.stream
            .flush()
            .await
            .or_err(WriteError, "while flushing request")
            .map_err(|e| e.into_remote())
    }

    async fn read_response_header(&mut self, max_header_size: usize) -> Result<ResponseHeader> {
        self.read_header_inner(max_header_size)
            .await
            .map_err(|e| e.into_remote())
    }

    async fn read_body(&mut self) -> Result<Option<Bytes>> {
        self.read_body_inner().await.map_err(|e| e.into_remote())
    }

    fn reusable(&self) -> bool {
        self.keepalive && self.body == Body::Done && self.buf.is_empty()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!("error shutting down connection: {e}");
        }
    }
}

fn build_header(resp: &httparse::Response<'_, '_>) -> Result<ResponseHeader> {
    let code = resp.code.unwrap_or_default();
    let status = StatusCode::from_u16(code).or_err(InvalidHeader, "invalid response status")?;
    let mut headers = HeaderMap::with_capacity(resp.headers.len());
    for h in resp.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .or_err_with(InvalidHeader, || format!("invalid header name {:?}", h.name))?;
        let value = HeaderValue::from_bytes(h.value)
            .or_err_with(InvalidHeader, || format!("invalid value of header {}", h.name))?;
        headers.append(name, value);
    }
    Ok(ResponseHeader {
        status,
        version: match resp.version {
            Some(1) => Version::HTTP_11,
            _ => Version::HTTP_10,
        },
        reason: resp.reason.map(|r| r.to_string()),
        headers,
    })
}

fn is_token(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

fn check_header(name: &str, value: &str) -> Result<()> {
    if name.is_empty() || !name.bytes().all(is_token) {
        return Error::e_explain(EncodingError, format!("invalid header name {name:?}"));
    }
    // visible chars, spaces, tabs and obs-text only
    if value.bytes().any(|b| (b < 0x20 && b != b'\t') || b == 0x7f) {
        return Error::e_explain(
            EncodingError,
            format!("invalid character in the value of header {name}"),
        );
    }
    Ok(())
}

/// Serialize the request head and body, refusing headers that are not valid on the wire
pub(crate) fn encode_request(req: &Request) -> Result<BytesMut> {
    for (name, value) in req.headers.iter() {
        check_header(name, value)?;
    }
    let mut buf = BytesMut::with_capacity(512 + req.body.len());

    // Request-Line
    buf.put_slice(req.method.as_str().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(req.path_and_query().as_bytes());
    buf.put_slice(b" HTTP/1.1\r\n");

    if !req.has_header("host") {
        if let Some(authority) = req.uri.authority() {
            buf.put_slice(b"Host: ");
            buf.put_slice(authority.as_str().as_bytes());
            buf.put_slice(CRLF);
        }
    }
    for (name, value) in req.headers.iter() {
        buf.put_slice(name.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(CRLF);
    }
    let needs_length = !req.body.is_empty()
        || matches!(req.method, Method::POST | Method::PUT | Method::PATCH);
    if needs_length && !req.has_header("content-length") {
        buf.put_slice(format!("Content-Length: {}\r\n", req.body.len()).as_bytes());
    }
    buf.put_slice(CRLF);
    buf.put_slice(&req.body);
    Ok(buf)
}
