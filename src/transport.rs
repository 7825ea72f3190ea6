use std::{io::Read, sync::Arc, time::Duration};

use reqwest::{blocking::Client, header::RANGE, StatusCode};
use thiserror::Error;
use tracing::debug;

use crate::error::{InstallError, Result};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{0}")]
    Transient(String),
    #[error("HTTP {0}")]
    Status(u16),
}

impl TransportError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Transient(_) => true,
            TransportError::Status(status) => *status >= 500 || matches!(*status, 408 | 429),
        }
    }
}

pub struct TransportResponse {
    /// `true` when the server honoured a range request (HTTP 206).
    pub partial: bool,
    pub content_length: Option<u64>,
    pub body: Box<dyn Read + Send>,
}

/// Plain retrieval, optionally starting at a byte offset. Everything the
/// installer pulls from the network goes through here.
pub trait Transport: Send + Sync {
    fn get(&self, url: &str, range_from: Option<u64>)
        -> std::result::Result<TransportResponse, TransportError>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn get(
        &self,
        url: &str,
        range_from: Option<u64>,
    ) -> std::result::Result<TransportResponse, TransportError> {
        (**self).get(url, range_from)
    }
}

pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(user_agent: &str, connect_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .connect_timeout(connect_timeout)
            .timeout(None::<Duration>)
            .build()
            .map_err(|err| InstallError::Config(format!("create http client: {err}")))?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn get(
        &self,
        url: &str,
        range_from: Option<u64>,
    ) -> std::result::Result<TransportResponse, TransportError> {
        let mut request = self.client.get(url);
        if let Some(offset) = range_from {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        debug!(url, range_from, "GET");
        let response = request
            .send()
            .map_err(|err| TransportError::Transient(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        Ok(TransportResponse {
            partial: status == StatusCode::PARTIAL_CONTENT,
            content_length: response.content_length(),
            body: Box::new(response),
        })
    }
}

#[cfg(test)]
pub mod testing {
    use std::{
        collections::{HashMap, VecDeque},
        io::{self, Cursor, Read},
        thread,
        time::Duration,
    };

    use parking_lot::Mutex;

    use super::{Transport, TransportError, TransportResponse};

    #[derive(Debug, Default, Clone)]
    struct Route {
        body: Vec<u8>,
        supports_range: bool,
        failures: VecDeque<u16>,
        cut_after: Option<usize>,
        delay: Duration,
    }

    /// In-memory stand-in for an HTTP server that records every request.
    #[derive(Default)]
    pub struct MemoryTransport {
        routes: Mutex<HashMap<String, Route>>,
        requests: Mutex<Vec<(String, Option<u64>)>>,
    }

    impl MemoryTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn serve(&self, url: &str, body: impl Into<Vec<u8>>) {
            self.routes.lock().insert(
                url.to_string(),
                Route {
                    body: body.into(),
                    ..Route::default()
                },
            );
        }

        pub fn with_ranges(&self, url: &str) {
            if let Some(route) = self.routes.lock().get_mut(url) {
                route.supports_range = true;
            }
        }

        /// Queue HTTP status failures returned before the body is served.
        pub fn fail_next(&self, url: &str, statuses: &[u16]) {
            if let Some(route) = self.routes.lock().get_mut(url) {
                route.failures.extend(statuses.iter().copied());
            }
        }

        /// The next response for `url` breaks with an io error after `bytes`.
        pub fn cut_next_after(&self, url: &str, bytes: usize) {
            if let Some(route) = self.routes.lock().get_mut(url) {
                route.cut_after = Some(bytes);
            }
        }

        pub fn slow(&self, url: &str, delay: Duration) {
            if let Some(route) = self.routes.lock().get_mut(url) {
                route.delay = delay;
            }
        }

        pub fn request_count(&self) -> usize {
            self.requests.lock().len()
        }

        pub fn requests(&self) -> Vec<(String, Option<u64>)> {
            self.requests.lock().clone()
        }
    }

    impl Transport for MemoryTransport {
        fn get(
            &self,
            url: &str,
            range_from: Option<u64>,
        ) -> Result<TransportResponse, TransportError> {
            self.requests.lock().push((url.to_string(), range_from));
            let (body, partial, cut_after, delay) = {
                let mut routes = self.routes.lock();
                let route = routes.get_mut(url).ok_or(TransportError::Status(404))?;
                if let Some(status) = route.failures.pop_front() {
                    return Err(TransportError::Status(status));
                }
                let offset = match range_from {
                    Some(offset) if route.supports_range => {
                        usize::try_from(offset).unwrap_or(usize::MAX).min(route.body.len())
                    }
                    _ => 0,
                };
                (
                    route.body[offset..].to_vec(),
                    route.supports_range && range_from.is_some(),
                    route.cut_after.take(),
                    route.delay,
                )
            };
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            let content_length = Some(body.len() as u64);
            let body: Box<dyn Read + Send> = match cut_after {
                Some(limit) => Box::new(CutReader {
                    inner: Cursor::new(body),
                    remaining: limit,
                }),
                None => Box::new(Cursor::new(body)),
            };
            Ok(TransportResponse {
                partial,
                content_length,
                body,
            })
        }
    }

    struct CutReader {
        inner: Cursor<Vec<u8>>,
        remaining: usize,
    }

    impl Read for CutReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.remaining == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "connection reset by peer",
                ));
            }
            let limit = buf.len().min(self.remaining);
            let read = self.inner.read(&mut buf[..limit])?;
            self.remaining -= read;
            Ok(read)
        }
    }
}
