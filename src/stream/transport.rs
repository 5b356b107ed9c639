//! Stream transport
//!
//! One network request per operation. Streamed operations read the response
//! body through the shared pump; recategorize is a plain JSON round trip
//! surfaced through the same handle shape. Nothing is retried or reconnected:
//! a retried POST could make the backend file the same capture twice.

use reqwest::multipart::{Form, Part};
use reqwest::{header, Client, RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::capture::{ClassificationMeta, InboxItemId, RunId, ThreadId};
use crate::config::{Config, Protocol};
use crate::events::CaptureEvent;

use super::handle::{pump, EventSender, StreamHandle};

/// One request against the capture backend
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    CaptureText {
        text: String,
        thread_id: ThreadId,
        run_id: RunId,
    },
    CaptureVoice {
        audio: Vec<u8>,
        file_name: String,
        mime_type: String,
    },
    FollowUp {
        inbox_item_id: InboxItemId,
        text: String,
        round: u32,
    },
    FollowUpVoice {
        inbox_item_id: InboxItemId,
        audio: Vec<u8>,
        file_name: String,
        mime_type: String,
        round: u32,
    },
    /// Non-streaming bucket correction
    Recategorize {
        inbox_item_id: InboxItemId,
        bucket: String,
    },
    /// Legacy streamed HITL response
    Respond {
        thread_id: ThreadId,
        bucket: String,
        inbox_item_id: Option<InboxItemId>,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::CaptureText { .. } => "capture_text",
            Operation::CaptureVoice { .. } => "capture_voice",
            Operation::FollowUp { .. } => "follow_up",
            Operation::FollowUpVoice { .. } => "follow_up_voice",
            Operation::Recategorize { .. } => "recategorize",
            Operation::Respond { .. } => "respond",
        }
    }
}

/// Opens streams for the workflow controller
pub trait Transport {
    /// Start `operation`. Never blocks; failures arrive as a `Failed` event.
    fn open(&self, operation: Operation) -> StreamHandle;
}

/// Endpoint paths for one protocol revision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    pub capture: &'static str,
    pub capture_voice: &'static str,
    pub follow_up: &'static str,
    pub follow_up_voice: &'static str,
    pub respond: &'static str,
}

impl Endpoints {
    pub fn for_protocol(protocol: Protocol) -> Self {
        match protocol {
            Protocol::V2 => Self {
                capture: "/api/capture",
                capture_voice: "/api/capture/voice",
                follow_up: "/api/capture/follow-up",
                follow_up_voice: "/api/capture/follow-up/voice",
                respond: "/api/ag-ui/respond",
            },
            Protocol::Legacy => Self {
                capture: "/api/ag-ui",
                capture_voice: "/api/voice-capture",
                follow_up: "/api/ag-ui/follow-up",
                follow_up_voice: "/api/capture/follow-up/voice",
                respond: "/api/ag-ui/respond",
            },
        }
    }

    /// `{base}/api/inbox/{id}/recategorize`, with the server-assigned id
    /// percent-encoded as a single path segment
    pub fn recategorize(base_url: &str, inbox_item_id: &InboxItemId) -> Option<Url> {
        let mut url = Url::parse(base_url).ok()?;
        url.path_segments_mut()
            .ok()?
            .pop_if_empty()
            .extend(["api", "inbox", inbox_item_id.as_str(), "recategorize"]);
        Some(url)
    }
}

/// A request that could not be built
#[derive(Debug, Error)]
enum RequestError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("invalid backend url {0:?}")]
    BaseUrl(String),
}

/// Transport over HTTP using reqwest
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    api_key: String,
    protocol: Protocol,
    endpoints: Endpoints,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecategorizeResponse {
    bucket: Option<String>,
    classification_meta: Option<ClassificationMeta>,
}

impl HttpTransport {
    pub fn new(config: &Config) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .build()?;

        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: Client, config: &Config) -> Self {
        Self {
            client,
            base_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            protocol: config.protocol,
            endpoints: Endpoints::for_protocol(config.protocol),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn post_stream(&self, path: &str) -> RequestBuilder {
        self.client
            .post(self.url(path))
            .bearer_auth(&self.api_key)
            .header(header::ACCEPT, "text/event-stream")
    }

    /// Build the request for a streamed operation
    fn stream_request(&self, operation: Operation) -> Result<RequestBuilder, RequestError> {
        let request = match operation {
            Operation::CaptureText {
                text,
                thread_id,
                run_id,
            } => {
                let body = match self.protocol {
                    Protocol::V2 => json!({
                        "text": text,
                        "thread_id": thread_id,
                        "run_id": run_id,
                    }),
                    Protocol::Legacy => json!({
                        "messages": [{
                            "id": format!("msg-{}", run_id.as_str().trim_start_matches("run-")),
                            "role": "user",
                            "content": text,
                        }],
                        "thread_id": thread_id,
                        "run_id": run_id,
                    }),
                };
                self.post_stream(self.endpoints.capture).json(&body)
            }
            Operation::CaptureVoice {
                audio,
                file_name,
                mime_type,
            } => {
                let form = Form::new().part("file", audio_part(audio, file_name, &mime_type)?);
                self.post_stream(self.endpoints.capture_voice).multipart(form)
            }
            Operation::FollowUp {
                inbox_item_id,
                text,
                round,
            } => self.post_stream(self.endpoints.follow_up).json(&json!({
                "inbox_item_id": inbox_item_id,
                "follow_up_text": text,
                "follow_up_round": round,
            })),
            Operation::FollowUpVoice {
                inbox_item_id,
                audio,
                file_name,
                mime_type,
                round,
            } => {
                let form = Form::new()
                    .text("inbox_item_id", inbox_item_id.to_string())
                    .text("follow_up_round", round.to_string())
                    .part("file", audio_part(audio, file_name, &mime_type)?);
                self.post_stream(self.endpoints.follow_up_voice).multipart(form)
            }
            Operation::Respond {
                thread_id,
                bucket,
                inbox_item_id,
            } => self.post_stream(self.endpoints.respond).json(&json!({
                "thread_id": thread_id,
                "response": bucket,
                "inbox_item_id": inbox_item_id,
            })),
            Operation::Recategorize {
                inbox_item_id,
                bucket,
            } => {
                let url = Endpoints::recategorize(&self.base_url, &inbox_item_id)
                    .ok_or_else(|| RequestError::BaseUrl(self.base_url.clone()))?;
                self.client
                    .patch(url)
                    .bearer_auth(&self.api_key)
                    .header(header::ACCEPT, "application/json")
                    .json(&json!({ "new_bucket": bucket }))
            }
        };

        Ok(request)
    }
}

fn audio_part(audio: Vec<u8>, file_name: String, mime_type: &str) -> Result<Part, reqwest::Error> {
    Part::bytes(audio).file_name(file_name).mime_str(mime_type)
}

fn status_failure(status: StatusCode) -> String {
    format!("request failed with status {}", status)
}

impl Transport for HttpTransport {
    fn open(&self, operation: Operation) -> StreamHandle {
        let name = operation.name();
        let recategorize = match &operation {
            Operation::Recategorize { bucket, .. } => Some(bucket.clone()),
            _ => None,
        };

        let request = match self.stream_request(operation) {
            Ok(request) => request,
            Err(e) => {
                warn!(operation = name, error = %e, "failed to build request");
                return StreamHandle::ready(CaptureEvent::Failed {
                    message: e.to_string(),
                });
            }
        };

        info!(operation = name, "opening stream");
        let (handle, sender) = StreamHandle::channel();
        match recategorize {
            Some(bucket) => tokio::spawn(run_recategorize(request, bucket, sender)),
            None => tokio::spawn(run_stream(request, name, sender)),
        };
        handle
    }
}

/// Send the request, or return `None` if cancelled first
async fn send(request: RequestBuilder, sender: &EventSender) -> Option<reqwest::Result<reqwest::Response>> {
    tokio::select! {
        biased;
        _ = sender.cancelled() => None,
        response = request.send() => Some(response),
    }
}

async fn run_stream(request: RequestBuilder, operation: &'static str, sender: EventSender) {
    let response = match send(request, &sender).await {
        None => {
            debug!(operation, "cancelled before response");
            return;
        }
        Some(Ok(response)) => response,
        Some(Err(e)) => {
            warn!(operation, error = %e, "request failed");
            sender.send(CaptureEvent::Failed { message: e.to_string() }).await;
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        warn!(operation, %status, "backend rejected request");
        sender.send(CaptureEvent::Failed { message: status_failure(status) }).await;
        return;
    }

    debug!(operation, %status, "stream opened");
    pump(Box::pin(response.bytes_stream()), sender).await;
}

async fn run_recategorize(request: RequestBuilder, bucket: String, sender: EventSender) {
    let response = match send(request, &sender).await {
        None => return,
        Some(Ok(response)) => response,
        Some(Err(e)) => {
            warn!(error = %e, "recategorize failed");
            sender.send(CaptureEvent::Failed { message: e.to_string() }).await;
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        warn!(%status, "recategorize rejected");
        sender.send(CaptureEvent::Failed { message: status_failure(status) }).await;
        return;
    }

    // the body is informational; a 2xx means the item moved
    let body: RecategorizeResponse = match response.json().await {
        Ok(body) => body,
        Err(e) => {
            debug!(error = %e, "recategorize response was not the expected JSON");
            RecategorizeResponse::default()
        }
    };

    let filed = body
        .classification_meta
        .as_ref()
        .map(|meta| meta.bucket.clone())
        .or(body.bucket)
        .unwrap_or(bucket);

    sender
        .send(CaptureEvent::Completed {
            result: format!("Filed -> {}", filed),
            classification: body.classification_meta,
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints_by_protocol() {
        let v2 = Endpoints::for_protocol(Protocol::V2);
        assert_eq!(v2.capture, "/api/capture");
        assert_eq!(v2.follow_up, "/api/capture/follow-up");
        let legacy = Endpoints::for_protocol(Protocol::Legacy);
        assert_eq!(legacy.capture, "/api/ag-ui");
        assert_eq!(legacy.capture_voice, "/api/voice-capture");
    }

    #[test]
    fn test_recategorize_url_encodes_item_id() {
        let url = Endpoints::recategorize("http://localhost:8000", &InboxItemId::new("abc"));
        assert_eq!(
            url.map(String::from).as_deref(),
            Some("http://localhost:8000/api/inbox/abc/recategorize")
        );

        let url = Endpoints::recategorize("https://brain.test/base", &InboxItemId::new("a b/c?d"));
        assert_eq!(
            url.map(String::from).as_deref(),
            Some("https://brain.test/base/api/inbox/a%20b%2Fc%3Fd/recategorize")
        );

        assert!(Endpoints::recategorize("not a url", &InboxItemId::new("abc")).is_none());
    }

    #[test]
    fn test_bad_base_url_fails_without_network() {
        let transport = HttpTransport::with_client(Client::new(), &Config::new("not a url", "k"));
        let request = transport.stream_request(Operation::Recategorize {
            inbox_item_id: InboxItemId::new("abc"),
            bucket: "Admin".into(),
        });
        assert!(matches!(request, Err(RequestError::BaseUrl(_))));
    }

    #[test]
    fn test_invalid_mime_fails_without_network() {
        let transport = HttpTransport::with_client(Client::new(), &Config::new("http://127.0.0.1:9", "k"));
        let request = transport.stream_request(Operation::CaptureVoice {
            audio: vec![1, 2, 3],
            file_name: "a.m4a".into(),
            mime_type: "not a mime".into(),
        });
        assert!(request.is_err());
    }
}
