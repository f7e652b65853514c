//! Network access for the synchronizer: payload fetches and server-sent event streams.
use std::collections::VecDeque;

use futures::{
    future::BoxFuture,
    stream::{self, BoxStream},
    FutureExt, StreamExt,
};
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CACHE_CONTROL},
    Url,
};

use crate::{payload::FeaturePayload, Error, Result};

use super::FetchRequest;

/// A fetched payload.
#[derive(Debug)]
pub struct FetchResponse {
    pub payload: FeaturePayload,
    /// The server announced support for server-sent events (`x-sse-support: enabled`).
    pub sse_supported: bool,
}

/// One server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

#[derive(Debug)]
pub enum StreamEvent {
    /// The connection is established.
    Open,
    Message(SseFrame),
    /// The connection failed. The stream ends after an error.
    Error(Error),
}

/// Fetches payloads and opens event streams.
///
/// The default implementation is [`HttpTransport`]. Returned futures and streams must not borrow
/// from the transport: they are driven from spawned tasks.
pub trait Transport: Send + Sync {
    fn fetch(&self, request: &FetchRequest) -> BoxFuture<'static, Result<FetchResponse>>;

    /// Open an event stream. The stream ends when the connection closes.
    fn stream(&self, request: &FetchRequest) -> BoxStream<'static, StreamEvent>;
}

/// [`Transport`] over HTTP.
///
/// - Features: `GET {api_host}/api/features/{client_key}`.
/// - Remote evaluation: `POST {api_host}/api/eval/{client_key}`.
/// - Streaming: `GET {streaming_host}/sub/{client_key}`.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::Client,
}

const SSE_SUPPORT_HEADER: &str = "x-sse-support";

impl HttpTransport {
    pub fn new() -> HttpTransport {
        HttpTransport::default()
    }

    pub fn with_client(client: reqwest::Client) -> HttpTransport {
        HttpTransport { client }
    }
}

fn endpoint(host: &str, path: &str, client_key: &str) -> Result<Url> {
    Url::parse(&format!("{}/{path}/{client_key}", host.trim_end_matches('/')))
        .map_err(Error::InvalidApiHost)
}

fn header_map(request: &FetchRequest) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in &request.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => {
                log::warn!(target: "growthbook", header = name.as_str(); "ignoring invalid request header");
            }
        }
    }
    headers
}

impl Transport for HttpTransport {
    fn fetch(&self, request: &FetchRequest) -> BoxFuture<'static, Result<FetchResponse>> {
        let client = self.client.clone();
        let headers = header_map(request);
        let request = request.clone();

        async move {
            let builder = match &request.remote_eval {
                Some(body) => client
                    .post(endpoint(&request.api_host, "api/eval", &request.client_key)?)
                    .json(body),
                None => client.get(endpoint(
                    &request.api_host,
                    "api/features",
                    &request.client_key,
                )?),
            };

            log::debug!(target: "growthbook", client_key = request.client_key.as_str(); "fetching features");
            let response = builder.headers(headers).send().await?;

            let status = response.status();
            if !status.is_success() {
                log::warn!(target: "growthbook", status = status.as_u16(); "received non-200 response while fetching features");
                return Err(Error::HttpStatus(status.as_u16()));
            }

            let sse_supported = response
                .headers()
                .get(SSE_SUPPORT_HEADER)
                .is_some_and(|value| value == "enabled");
            let body = response.bytes().await?;
            let payload = FeaturePayload::from_json(&body)?;

            log::debug!(target: "growthbook", client_key = request.client_key.as_str(), sse_supported = sse_supported; "successfully fetched features");
            Ok(FetchResponse {
                payload,
                sse_supported,
            })
        }
        .boxed()
    }

    fn stream(&self, request: &FetchRequest) -> BoxStream<'static, StreamEvent> {
        let client = self.client.clone();
        let mut headers = header_map(request);
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        let url = endpoint(&request.streaming_host, "sub", &request.client_key);

        let connect = async move {
            let response = match url {
                Ok(url) => client.get(url).headers(headers).send().await,
                Err(err) => return stream::iter([StreamEvent::Error(err)]).boxed(),
            };
            let response = match response {
                Ok(response) if response.status().is_success() => response,
                Ok(response) => {
                    let status = response.status().as_u16();
                    return stream::iter([StreamEvent::Error(Error::HttpStatus(status))]).boxed();
                }
                Err(err) => return stream::iter([StreamEvent::Error(err.into())]).boxed(),
            };

            let body = response.bytes_stream().boxed();
            let frames = stream::unfold(
                (body, SseParser::default(), VecDeque::new(), false),
                |(mut body, mut parser, mut pending, mut done)| async move {
                    loop {
                        if let Some(event) = pending.pop_front() {
                            return Some((event, (body, parser, pending, done)));
                        }
                        if done {
                            return None;
                        }
                        match body.next().await {
                            Some(Ok(chunk)) => {
                                pending.extend(parser.push(&chunk).into_iter().map(StreamEvent::Message));
                            }
                            Some(Err(err)) => {
                                done = true;
                                pending.push_back(StreamEvent::Error(err.into()));
                            }
                            None => done = true,
                        }
                    }
                },
            );

            stream::iter([StreamEvent::Open]).chain(frames).boxed()
        };

        stream::once(connect).flatten().boxed()
    }
}

/// Incremental parser for the `text/event-stream` format.
#[derive(Debug, Default)]
pub(crate) struct SseParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Option<String>,
}

impl SseParser {
    /// Feed a chunk of the body, returning the events it completed.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);

            if line.is_empty() {
                if let Some(data) = self.data.take() {
                    frames.push(SseFrame {
                        event: self.event.take().unwrap_or_else(|| "message".to_owned()),
                        data,
                    });
                }
                self.event = None;
                continue;
            }

            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (&*line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_owned()),
                "data" => match &mut self.data {
                    Some(data) => {
                        data.push('\n');
                        data.push_str(value);
                    }
                    None => self.data = Some(value.to_owned()),
                },
                _ => {}
            }
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use wiremock::{
        matchers::{body_json, header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::{HttpTransport, SseFrame, SseParser, StreamEvent, Transport};
    use crate::{
        sync::{FetchRequest, RemoteEvalRequest},
        Error,
    };

    #[test]
    fn parses_frames_split_across_chunks() {
        let mut parser = SseParser::default();

        assert!(parser.push(b"event: features\r\nda").is_empty());
        assert!(parser.push(b"ta: {\"a\":").is_empty());
        let frames = parser.push(b"1}\n\n: keep-alive\n\ndata: x\ndata: y\n\n");

        assert_eq!(
            frames,
            vec![
                SseFrame {
                    event: "features".to_owned(),
                    data: "{\"a\":1}".to_owned(),
                },
                SseFrame {
                    event: "message".to_owned(),
                    data: "x\ny".to_owned(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn fetches_features() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/features/sdk-abc"))
            .and(header("x-custom", "1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-sse-support", "enabled")
                    .set_body_string(r#"{"features": {"f": {"defaultValue": 1}}, "dateUpdated": "v1"}"#),
            )
            .expect(1)
            .mount(&server)
            .await;

        let mut request = FetchRequest::new(server.uri(), "sdk-abc");
        request.headers.insert("x-custom".to_owned(), "1".to_owned());
        let response = HttpTransport::new().fetch(&request).await.unwrap();

        assert!(response.sse_supported);
        assert_eq!(response.payload.date_updated.as_deref(), Some("v1"));
        assert!(response.payload.get_feature("f").is_some());
    }

    #[tokio::test]
    async fn remote_eval_posts_user_context() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/eval/sdk-abc"))
            .and(body_json(serde_json::json!({
                "attributes": {"id": "1"},
                "forcedVariations": {},
                "forcedFeatures": [],
                "url": "https://example.com"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .expect(1)
            .mount(&server)
            .await;

        let mut request = FetchRequest::new(server.uri(), "sdk-abc");
        request.remote_eval = Some(RemoteEvalRequest {
            attributes: serde_json::json!({"id": "1"}).as_object().cloned().unwrap(),
            url: "https://example.com".to_owned(),
            ..Default::default()
        });
        let response = HttpTransport::new().fetch(&request).await.unwrap();

        assert!(!response.sse_supported);
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let result = HttpTransport::new()
            .fetch(&FetchRequest::new(server.uri(), "sdk-abc"))
            .await;

        assert!(matches!(result, Err(Error::HttpStatus(401))));
    }

    #[tokio::test]
    async fn streams_server_sent_events() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sub/sdk-abc"))
            .and(header("accept", "text/event-stream"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string("event: features-updated\ndata: {}\n\n"),
            )
            .mount(&server)
            .await;

        let events: Vec<StreamEvent> = HttpTransport::new()
            .stream(&FetchRequest::new(server.uri(), "sdk-abc"))
            .collect()
            .await;

        assert!(matches!(events[0], StreamEvent::Open));
        assert!(matches!(
            &events[1],
            StreamEvent::Message(frame) if frame.event == "features-updated"
        ));
        assert_eq!(events.len(), 2);
    }
}
