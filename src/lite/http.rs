//
// Copyright 2025 Rendezvous RTC Contributors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The HTTP capability consumed by the signaling client, and common
//! types like Method, Request and Response.
//!
//! The library never owns a socket: requests go through an injected
//! [`Client`]. Host applications that already have a transport provide
//! a [`Delegate`] and use [`DelegatingClient`]; standalone consumers
//! can enable the `ureq` feature for [`ureq_client::UreqClient`].

use std::{collections::HashMap, sync::Arc};

use crate::core::sync::NamedMutex;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Method {
    Get,
    Put,
    Post,
    Delete,
}

#[derive(Clone, Debug)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

#[derive(Clone, Debug)]
pub struct Response {
    pub status_code: u16,
    pub body: Vec<u8>,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// A `None` response indicates a transport-level failure.
pub type ResponseCallback = Box<dyn FnOnce(Option<Response>) + Send>;

/// An abstract HTTP client. Rust consumers of HTTP clients should use
/// this trait; apps should install a platform-specific impl.
pub trait Client: Send + Sync {
    fn send_request(&self, request: Request, callback: ResponseCallback);
}

/// The transport half an application supplies when it owns the HTTP
/// stack. Each outgoing request carries a ticket; the app performs the
/// request however it likes and echoes the ticket back through
/// [`DelegatingClient::complete`].
pub trait Delegate: Send + Sync {
    fn send_request(&self, ticket: u32, request: Request);
}

/// A [`Client`] backed by an app-provided [`Delegate`].
///
/// Pending callbacks are parked under their ticket until the app
/// completes them; tickets wrap around.
#[derive(Clone)]
pub struct DelegatingClient {
    inner: Arc<DelegatingInner>,
}

struct DelegatingInner {
    delegate: Box<dyn Delegate>,
    pending: NamedMutex<PendingRequests>,
}

#[derive(Default)]
struct PendingRequests {
    parked: HashMap<u32, ResponseCallback>,
    next_ticket: u32,
}

impl PendingRequests {
    fn park(&mut self, callback: ResponseCallback) -> u32 {
        let ticket = self.next_ticket;
        self.next_ticket = self.next_ticket.wrapping_add(1);
        self.parked.insert(ticket, callback);
        ticket
    }
}

impl DelegatingClient {
    pub fn new(delegate: impl Delegate + 'static) -> Self {
        Self {
            inner: Arc::new(DelegatingInner {
                delegate: Box::new(delegate),
                pending: NamedMutex::new(
                    PendingRequests::default(),
                    "http::DelegatingClient::pending",
                ),
            }),
        }
    }

    /// Resolves the request identified by `ticket`. A `None` response
    /// indicates the transport failed.
    pub fn complete(&self, ticket: u32, response: Option<Response>) {
        debug!("http::DelegatingClient::complete(): ticket: {}", ticket);
        let callback = match self.inner.pending.lock() {
            Ok(mut pending) => pending.parked.remove(&ticket),
            Err(_) => None,
        };
        match callback {
            Some(callback) => callback(response),
            None => error!(
                "http::DelegatingClient::complete(): unknown ticket: {}",
                ticket
            ),
        }
    }
}

impl Client for DelegatingClient {
    fn send_request(&self, request: Request, callback: ResponseCallback) {
        debug!(
            "http::DelegatingClient::send_request(): {} {:?}",
            request.url, request.method
        );
        let ticket = match self.inner.pending.lock() {
            Ok(mut pending) => pending.park(callback),
            Err(_) => {
                // A poisoned registry can never route the response.
                callback(None);
                return;
            }
        };
        self.inner.delegate.send_request(ticket, request);
    }
}

#[cfg(feature = "ureq")]
pub mod ureq_client {
    //! A default blocking client. Each request runs as a task on a
    //! private actor so callers never block on I/O.

    use super::{Client, Method, Request, Response, ResponseCallback};
    use crate::common::{
        actor::{Actor, Stopper},
        Result,
    };
    use std::io::Read;

    #[derive(Clone)]
    pub struct UreqClient {
        actor: Actor<ureq::Agent>,
    }

    impl UreqClient {
        pub fn start(stopper: Stopper) -> Result<Self> {
            Ok(Self {
                actor: Actor::start("UreqClient", stopper, |_| Ok(ureq::agent()))?,
            })
        }
    }

    impl Client for UreqClient {
        fn send_request(&self, request: Request, response_callback: ResponseCallback) {
            let Request {
                method,
                url,
                headers,
                body,
            } = request;

            self.actor.send(move |agent| {
                let mut req = match method {
                    Method::Get => agent.get(&url),
                    Method::Put => agent.put(&url),
                    Method::Post => agent.post(&url),
                    Method::Delete => agent.delete(&url),
                };
                for (key, value) in headers.iter() {
                    req = req.set(key, value);
                }
                let request_result = match body {
                    Some(body) => req.send_bytes(&body),
                    None => req.call(),
                };
                let response = match request_result {
                    Ok(response) => read_body(response),
                    // Non-2xx statuses still carry a body the caller
                    // classifies; only transport errors become None.
                    Err(ureq::Error::Status(_code, response)) => read_body(response),
                    Err(ureq::Error::Transport(_)) => None,
                };
                response_callback(response);
            });
        }
    }

    fn read_body(response: ureq::Response) -> Option<Response> {
        let status_code = response.status();
        let mut body = Vec::new();
        if response.into_reader().read_to_end(&mut body).is_ok() {
            Some(Response { status_code, body })
        } else {
            None
        }
    }
}
