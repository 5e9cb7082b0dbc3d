use std::io::Read;
use std::time::Duration;

use crate::error::TransferError;

pub enum Body {
    Empty,
    Bytes(Vec<u8>),
    /// Streamed body of a known length.
    Stream {
        reader: Box<dyn Read + Send>,
        len: u64,
    },
}

/// A POST to one Dropbox endpoint; every API v2 call uses POST.
pub struct ApiRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Body,
}

impl ApiRequest {
    pub fn post(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            body: Body::Empty,
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }
}

pub struct ApiResponse {
    pub status: u16,
    body: Box<dyn Read + Send>,
}

impl ApiResponse {
    pub fn new(status: u16, body: Box<dyn Read + Send>) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn into_reader(self) -> Box<dyn Read + Send> {
        self.body
    }

    pub fn text(mut self) -> Result<String, TransferError> {
        let mut buf = Vec::new();
        self.body
            .read_to_end(&mut buf)
            .map_err(|e| TransferError::Transport(e.to_string()))?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

/// Generic request primitive the client is built on.
pub trait Transport: Send + Sync {
    fn execute(&self, request: ApiRequest) -> Result<ApiResponse, TransferError>;
}

/// Blocking reqwest transport.
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    /// `timeout` of `None` lets large transfers run as long as they need.
    pub fn new(timeout: Option<Duration>) -> Result<Self, TransferError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("dropctl/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn execute(&self, request: ApiRequest) -> Result<ApiResponse, TransferError> {
        let mut builder = self.client.post(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match request.body {
            Body::Empty => builder,
            Body::Bytes(bytes) => builder.body(bytes),
            Body::Stream { reader, len } => {
                builder.body(reqwest::blocking::Body::sized(reader, len))
            }
        };
        let resp = builder.send()?;
        let status = resp.status().as_u16();
        Ok(ApiResponse::new(status, Box::new(resp)))
    }
}
