//
// Copyright 2025 Rendezvous RTC Contributors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Typed client for the rendezvous server's HTTP surface: offers,
//! answers, ICE exchange, usernames and service discovery.
//!
//! Every operation goes through the injected [`http::Client`] and
//! completes via a boxed handler; nothing here blocks. Non-2xx
//! responses carry an `{"error": "..."}` body and are classified into
//! the `ClientError` taxonomy by status code. Optional getters map a
//! 404 to `Ok(None)`.

use std::sync::Arc;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::{
    common::{OfferId, PeerId, Result, Role, ServerTimestamp},
    core::sync::NamedMutex,
    error::ClientError,
    lite::http,
};

/// Issued by the server at registration; attached to authenticated
/// requests as a bearer token. Immutable once obtained.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Credential {
    #[serde(rename = "peerId")]
    pub peer_id: PeerId,
    pub secret: String,
}

/// One offer to publish.
#[derive(Clone, Debug, Serialize)]
pub struct OfferSpec {
    pub sdp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topics: Option<Vec<String>>,
    /// Offer lifetime in milliseconds; server default applies when absent.
    #[serde(rename = "ttl", skip_serializing_if = "Option::is_none")]
    pub ttl_millis: Option<u64>,
}

/// A published offer as the server knows it. The answer fields are
/// filled in by the server once a peer answers.
#[derive(Clone, Debug, Deserialize)]
pub struct OfferRecord {
    pub id: OfferId,
    pub sdp: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(rename = "createdAt", default)]
    pub created_at: ServerTimestamp,
    #[serde(rename = "expiresAt", default)]
    pub expires_at: ServerTimestamp,
    #[serde(rename = "answererPeerId", default)]
    pub answerer_peer_id: Option<PeerId>,
    #[serde(rename = "answerSdp", default)]
    pub answer_sdp: Option<String>,
    #[serde(rename = "answeredAt", default)]
    pub answered_at: Option<ServerTimestamp>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AnswerRecord {
    #[serde(rename = "offerId")]
    pub offer_id: OfferId,
    #[serde(rename = "answererPeerId", default)]
    pub answerer_peer_id: PeerId,
    pub sdp: String,
    #[serde(rename = "answeredAt", default)]
    pub answered_at: ServerTimestamp,
}

#[derive(Clone, Debug, Serialize)]
pub struct IceCandidateUpload {
    pub candidate: String,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    pub role: Role,
}

/// Append-only at the server; consumers filter by role and watermark.
#[derive(Clone, Debug, Deserialize)]
pub struct IceCandidateRecord {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    pub role: Role,
    #[serde(rename = "peerId", default)]
    pub peer_id: PeerId,
    #[serde(rename = "createdAt", default)]
    pub created_at: ServerTimestamp,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServiceRecord {
    pub uuid: String,
    #[serde(default)]
    pub username: String,
    pub fqn: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(rename = "isPublic", default)]
    pub is_public: bool,
    /// The service's currently advertised offer, when one is outstanding.
    #[serde(rename = "offerId", default)]
    pub offer_id: Option<OfferId>,
    #[serde(rename = "createdAt", default)]
    pub created_at: ServerTimestamp,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublishServiceRequest {
    pub fqn: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(rename = "isPublic")]
    pub is_public: bool,
    #[serde(rename = "ttl", skip_serializing_if = "Option::is_none")]
    pub ttl_millis: Option<u64>,
    #[serde(rename = "publicKey")]
    pub public_key: String,
    pub signature: String,
    pub message: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct UsernameStatus {
    pub available: bool,
    #[serde(rename = "publicKey", default)]
    pub public_key: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
struct ClaimUsernameRequest {
    #[serde(rename = "publicKey")]
    public_key: String,
    signature: String,
    message: String,
}

// Envelope forms the server wraps lists in.
#[derive(Serialize)]
struct SerializedOfferBatch {
    offers: Vec<OfferSpec>,
}

#[derive(Deserialize)]
struct SerializedOffers {
    offers: Vec<OfferRecord>,
}

#[derive(Deserialize)]
struct SerializedAnswers {
    answers: Vec<AnswerRecord>,
}

#[derive(Serialize)]
struct SerializedCandidateBatch {
    candidates: Vec<IceCandidateUpload>,
}

#[derive(Deserialize)]
struct SerializedCandidates {
    candidates: Vec<IceCandidateRecord>,
}

#[derive(Deserialize)]
struct SerializedServices {
    services: Vec<ServiceRecord>,
}

#[derive(Serialize)]
struct SerializedAnswer<'a> {
    sdp: &'a str,
}

#[derive(Deserialize)]
struct SerializedAnswerCreated {
    #[serde(rename = "offerId")]
    offer_id: OfferId,
}

#[derive(Deserialize)]
struct SerializedErrorBody {
    error: String,
}

/// Completion handler for one signaling operation.
pub type ResponseHandler<T> = Box<dyn FnOnce(Result<T>) + Send>;

/// Whether an operation carries the bearer credential.
#[derive(Clone, Copy, PartialEq)]
enum Auth {
    Required,
    Public,
}

#[derive(Clone)]
pub struct SignalingClient {
    inner: Arc<Inner>,
}

struct Inner {
    http: Arc<dyn http::Client>,
    base_url: String,
    credential: NamedMutex<Option<Credential>>,
}

impl SignalingClient {
    pub fn new(http: Arc<dyn http::Client>, base_url: &str) -> Self {
        Self {
            inner: Arc::new(Inner {
                http,
                base_url: base_url.trim_end_matches('/').to_string(),
                credential: NamedMutex::new(None, "SignalingClient::credential"),
            }),
        }
    }

    /// Installs a credential obtained elsewhere (e.g. persisted by the
    /// app). `register` does this automatically.
    pub fn set_credential(&self, credential: Credential) {
        if let Ok(mut guard) = self.inner.credential.lock() {
            *guard = Some(credential);
        }
    }

    pub fn credential(&self) -> Option<Credential> {
        self.inner.credential.lock().ok().and_then(|c| c.clone())
    }

    /// POST /register. On success the returned credential is also
    /// installed on this client for subsequent authenticated calls.
    pub fn register(&self, done: ResponseHandler<Credential>) {
        let this = self.clone();
        self.request(
            http::Method::Post,
            "/register".to_string(),
            None,
            Auth::Public,
            Box::new(move |result: Result<Credential>| {
                if let Ok(credential) = &result {
                    this.set_credential(credential.clone());
                }
                done(result);
            }),
        );
    }

    /// POST /offers: authenticated batch creation.
    pub fn create_offers(&self, offers: Vec<OfferSpec>, done: ResponseHandler<Vec<OfferRecord>>) {
        for spec in &offers {
            if let Some(topics) = &spec.topics {
                if let Err(err) = validate_topics(topics) {
                    done(Err(err));
                    return;
                }
            }
        }
        self.request(
            http::Method::Post,
            "/offers".to_string(),
            serialize_body(&SerializedOfferBatch { offers }),
            Auth::Required,
            map_handler(done, |batch: SerializedOffers| batch.offers),
        );
    }

    /// GET /offers/{id}; absent offers are `Ok(None)`.
    pub fn get_offer(&self, offer_id: &str, done: ResponseHandler<Option<OfferRecord>>) {
        self.request_optional(
            http::Method::Get,
            format!("/offers/{}", encode_component(offer_id)),
            None,
            Auth::Required,
            done,
        );
    }

    /// GET /offers/mine: authenticated inventory.
    pub fn list_my_offers(&self, done: ResponseHandler<Vec<OfferRecord>>) {
        self.request(
            http::Method::Get,
            "/offers/mine".to_string(),
            None,
            Auth::Required,
            map_handler(done, |batch: SerializedOffers| batch.offers),
        );
    }

    /// PUT /offers/{id}/heartbeat: extends the offer TTL.
    pub fn heartbeat_offer(&self, offer_id: &str, done: ResponseHandler<()>) {
        self.request_no_content(
            http::Method::Put,
            format!("/offers/{}/heartbeat", encode_component(offer_id)),
            None,
            Auth::Required,
            done,
        );
    }

    /// DELETE /offers/{id}.
    pub fn delete_offer(&self, offer_id: &str, done: ResponseHandler<()>) {
        self.request_no_content(
            http::Method::Delete,
            format!("/offers/{}", encode_component(offer_id)),
            None,
            Auth::Required,
            done,
        );
    }

    /// POST /offers/{id}/answer: submit an answer SDP.
    pub fn answer_offer(&self, offer_id: &str, sdp: &str, done: ResponseHandler<OfferId>) {
        self.request(
            http::Method::Post,
            format!("/offers/{}/answer", encode_component(offer_id)),
            serialize_body(&SerializedAnswer { sdp }),
            Auth::Required,
            map_handler(done, |created: SerializedAnswerCreated| created.offer_id),
        );
    }

    /// GET /offers/answers?since=: batch poll answers across all of
    /// this peer's offers. `since` is the caller's watermark.
    pub fn get_answers(&self, since: ServerTimestamp, done: ResponseHandler<Vec<AnswerRecord>>) {
        self.request(
            http::Method::Get,
            format!("/offers/answers?since={}", since),
            None,
            Auth::Required,
            map_handler(done, |batch: SerializedAnswers| batch.answers),
        );
    }

    /// POST /offers/{id}/ice-candidates.
    pub fn add_ice_candidates(
        &self,
        offer_id: &str,
        candidates: Vec<IceCandidateUpload>,
        done: ResponseHandler<()>,
    ) {
        self.request_no_content(
            http::Method::Post,
            format!("/offers/{}/ice-candidates", encode_component(offer_id)),
            serialize_body(&SerializedCandidateBatch { candidates }),
            Auth::Required,
            done,
        );
    }

    /// GET /offers/{id}/ice-candidates?since=: records carry `role`;
    /// the caller filters to the opposite side and advances its watermark.
    pub fn get_ice_candidates(
        &self,
        offer_id: &str,
        since: ServerTimestamp,
        done: ResponseHandler<Vec<IceCandidateRecord>>,
    ) {
        self.request(
            http::Method::Get,
            format!(
                "/offers/{}/ice-candidates?since={}",
                encode_component(offer_id),
                since
            ),
            None,
            Auth::Required,
            map_handler(done, |batch: SerializedCandidates| batch.candidates),
        );
    }

    /// GET /offers/by-topic/{topic}: public search. `bloom` is an
    /// opaque client-side filter passed through base64-encoded.
    pub fn find_by_topic(
        &self,
        topic: &str,
        limit: usize,
        bloom: Option<&[u8]>,
        done: ResponseHandler<Vec<OfferRecord>>,
    ) {
        if topic.is_empty() {
            done(Err(ClientError::Validation("empty topic".to_string()).into()));
            return;
        }
        let mut path = format!(
            "/offers/by-topic/{}?limit={}",
            encode_component(topic),
            limit
        );
        if let Some(bloom) = bloom {
            path.push_str("&bloom=");
            path.push_str(&encode_component(&BASE64.encode(bloom)));
        }
        self.request(
            http::Method::Get,
            path,
            None,
            Auth::Public,
            map_handler(done, |batch: SerializedOffers| batch.offers),
        );
    }

    /// POST /users/{username}: claim a username with an ed25519 proof.
    pub fn claim_username(
        &self,
        username: &str,
        public_key: &str,
        signature: &str,
        message: &str,
        done: ResponseHandler<()>,
    ) {
        if let Err(err) = crate::lite::fqn::validate_username(username) {
            done(Err(err));
            return;
        }
        self.request_no_content(
            http::Method::Post,
            format!("/users/{}", encode_component(username)),
            serialize_body(&ClaimUsernameRequest {
                public_key: public_key.to_string(),
                signature: signature.to_string(),
                message: message.to_string(),
            }),
            Auth::Required,
            done,
        );
    }

    /// GET /users/{username}: public availability lookup.
    pub fn check_username(&self, username: &str, done: ResponseHandler<Option<UsernameStatus>>) {
        self.request_optional(
            http::Method::Get,
            format!("/users/{}", encode_component(username)),
            None,
            Auth::Public,
            done,
        );
    }

    /// POST /users/{username}/services: publish a signed service.
    pub fn publish_service(
        &self,
        username: &str,
        request: PublishServiceRequest,
        done: ResponseHandler<ServiceRecord>,
    ) {
        if let Err(err) = crate::lite::fqn::Fqn::parse(&request.fqn) {
            done(Err(err));
            return;
        }
        self.request(
            http::Method::Post,
            format!("/users/{}/services", encode_component(username)),
            serialize_body(&request),
            Auth::Required,
            done,
        );
    }

    /// GET /services/{uuid}.
    pub fn get_service(&self, uuid: &str, done: ResponseHandler<Option<ServiceRecord>>) {
        self.request_optional(
            http::Method::Get,
            format!("/services/{}", encode_component(uuid)),
            None,
            Auth::Required,
            done,
        );
    }

    /// GET /users/{username}/services/{fqn}: direct lookup.
    pub fn lookup_service(
        &self,
        username: &str,
        fqn: &str,
        done: ResponseHandler<Option<ServiceRecord>>,
    ) {
        self.request_optional(
            http::Method::Get,
            format!(
                "/users/{}/services/{}",
                encode_component(username),
                encode_component(fqn)
            ),
            None,
            Auth::Required,
            done,
        );
    }

    /// GET /services?version=&limit=&offset=: paged public discovery.
    pub fn discover_services(
        &self,
        version: &str,
        limit: usize,
        offset: usize,
        done: ResponseHandler<Vec<ServiceRecord>>,
    ) {
        self.request(
            http::Method::Get,
            format!(
                "/services?version={}&limit={}&offset={}",
                encode_component(version),
                limit,
                offset
            ),
            None,
            Auth::Public,
            map_handler(done, |batch: SerializedServices| batch.services),
        );
    }

    fn request<T: DeserializeOwned + Send + 'static>(
        &self,
        method: http::Method,
        path: String,
        body: Option<Result<Vec<u8>>>,
        auth: Auth,
        done: ResponseHandler<T>,
    ) {
        let what = path.clone();
        self.send_raw(
            method,
            path,
            body,
            auth,
            Box::new(move |result| {
                done(result.and_then(|response| {
                    serde_json::from_slice::<T>(&response.body).map_err(|err| {
                        ClientError::Network(format!("bad response body for {}: {}", what, err))
                            .into()
                    })
                }));
            }),
        );
    }

    /// Like `request`, but tolerates an empty success body.
    fn request_no_content(
        &self,
        method: http::Method,
        path: String,
        body: Option<Result<Vec<u8>>>,
        auth: Auth,
        done: ResponseHandler<()>,
    ) {
        self.send_raw(
            method,
            path,
            body,
            auth,
            Box::new(move |result| done(result.map(|_| ()))),
        );
    }

    /// Like `request`, but a 404 completes with `Ok(None)`.
    fn request_optional<T: DeserializeOwned + Send + 'static>(
        &self,
        method: http::Method,
        path: String,
        body: Option<Result<Vec<u8>>>,
        auth: Auth,
        done: ResponseHandler<Option<T>>,
    ) {
        let what = path.clone();
        self.send_raw(
            method,
            path,
            body,
            auth,
            Box::new(move |result| {
                let mapped = match result {
                    Ok(response) => serde_json::from_slice::<T>(&response.body)
                        .map(Some)
                        .map_err(|err| {
                            ClientError::Network(format!(
                                "bad response body for {}: {}",
                                what, err
                            ))
                            .into()
                        }),
                    Err(err) => match err.downcast_ref::<ClientError>() {
                        Some(ClientError::NotFound(_)) => Ok(None),
                        _ => Err(err),
                    },
                };
                done(mapped);
            }),
        );
    }

    fn send_raw(
        &self,
        method: http::Method,
        path: String,
        body: Option<Result<Vec<u8>>>,
        auth: Auth,
        done: ResponseHandler<http::Response>,
    ) {
        let body = match body {
            None => None,
            Some(Ok(bytes)) => Some(bytes),
            Some(Err(err)) => {
                done(Err(err));
                return;
            }
        };

        let mut headers = std::collections::HashMap::new();
        if body.is_some() {
            headers.insert("Content-Type".to_string(), "application/json".to_string());
        }
        if auth == Auth::Required {
            match self.credential() {
                Some(credential) => {
                    headers.insert(
                        "Authorization".to_string(),
                        format!("Bearer {}:{}", credential.peer_id, credential.secret),
                    );
                }
                None => {
                    done(Err(ClientError::Auth(
                        "no credential; call register first".to_string(),
                    )
                    .into()));
                    return;
                }
            }
        }

        let url = format!("{}{}", self.inner.base_url, path);
        debug!("signaling: {:?} {}", method, url);
        let what = path;
        self.inner.http.send_request(
            http::Request {
                method,
                url,
                headers,
                body,
            },
            Box::new(move |response| match response {
                None => done(Err(ClientError::Network(format!(
                    "transport failure for {}",
                    what
                ))
                .into())),
                Some(response) if response.is_success() => done(Ok(response)),
                Some(response) => done(Err(classify_status(
                    response.status_code,
                    &response.body,
                    &what,
                )
                .into())),
            }),
        );
    }
}

/// Maps a non-2xx status to the error taxonomy. The server's
/// `{"error": "..."}` body supplies the message when parseable.
fn classify_status(status_code: u16, body: &[u8], what: &str) -> ClientError {
    let message = serde_json::from_slice::<SerializedErrorBody>(body)
        .map(|body| body.error)
        .unwrap_or_else(|_| format!("status {} for {}", status_code, what));
    match status_code {
        400 => ClientError::Validation(message),
        401 | 403 => ClientError::Auth(message),
        404 => ClientError::NotFound(message),
        _ => ClientError::Network(message),
    }
}

fn serialize_body<T: Serialize>(body: &T) -> Option<Result<Vec<u8>>> {
    Some(
        serde_json::to_vec(body)
            .map_err(|err| ClientError::Validation(format!("unserializable body: {}", err)).into()),
    )
}

fn map_handler<T: Send + 'static, U: Send + 'static>(
    done: ResponseHandler<U>,
    map: impl FnOnce(T) -> U + Send + 'static,
) -> ResponseHandler<T> {
    Box::new(move |result| done(result.map(map)))
}

fn validate_topics(topics: &[String]) -> Result<()> {
    if topics.iter().any(|topic| topic.is_empty()) {
        return Err(ClientError::Validation("empty topic".to_string()).into());
    }
    Ok(())
}

/// Percent-encodes everything outside the URL-unreserved set.
fn encode_component(component: &str) -> String {
    let mut encoded = String::with_capacity(component.len());
    for byte in component.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'@' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}
