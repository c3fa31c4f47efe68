//! The streaming relay shared by every wizard stage.
//!
//! One invocation issues exactly one upstream call and turns whatever comes
//! back into a sequence of [`RelayFrame`]s that always ends in exactly one
//! terminal frame. Failures found before the response head is committed are
//! returned as [`RelayError`] so the caller can answer with a plain JSON
//! error; failures found afterwards become a terminal `error` frame appended
//! to whatever partial content was already delivered.
//!
//! A relay runs as a producer task feeding a bounded channel. The SSE body
//! drains the channel, so a slow client stops upstream reads instead of
//! growing a buffer, and a dropped client ends the producer right away.

use std::{
    convert::Infallible,
    sync::Arc,
    time::{Duration, Instant as StdInstant},
};

use axum::{
    http::{header, HeaderValue},
    response::{
        sse::{KeepAlive, Sse},
        IntoResponse, Response,
    },
};
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tokio::{
    sync::{mpsc, oneshot},
    time::{timeout_at, Instant},
};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::{
    decoder::{Decoded, SseDecoder, Utf8Chunker},
    errors::RelayError,
    frame::{Pricing, RelayFrame, Usage},
    metrics::AppMetrics,
    models::{StreamRequest, WizardStage},
    upstream::{BodyKind, ByteStream, Upstream, UpstreamDescriptor},
};

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub channel_capacity: usize,
    pub malformed_frame_limit: usize,
    pub max_line_bytes: usize,
    pub max_buffered_bytes: usize,
    pub keep_alive: Option<Duration>,
    pub pricing: Pricing,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            channel_capacity: 16,
            malformed_frame_limit: 8,
            max_line_bytes: 1024 * 1024,
            max_buffered_bytes: 8 * 1024 * 1024,
            keep_alive: None,
            pricing: Pricing::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    UpstreamPending,
    Relaying,
    Buffering,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Completed,
    Failed(RelayError),
    ClientAborted,
}

impl RelayOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RelayOutcome::Completed => "completed",
            RelayOutcome::Failed(_) => "failed",
            RelayOutcome::ClientAborted => "client_aborted",
        }
    }
}

/// What happened on one relay, reported once the producer has finished.
#[derive(Debug, Clone)]
pub struct RelaySummary {
    pub request_id: String,
    pub stage: WizardStage,
    pub session_token: Option<String>,
    pub upstream_session_id: Option<String>,
    pub outcome: RelayOutcome,
    pub usage: Option<Usage>,
    pub frames: usize,
    pub malformed: usize,
    pub elapsed: Duration,
}

/// Frames of an open relay plus its eventual summary.
pub struct RelayStream {
    pub frames: ReceiverStream<RelayFrame>,
    pub summary: oneshot::Receiver<RelaySummary>,
}

pub struct RelayHandle {
    pub response: Response,
    pub summary: oneshot::Receiver<RelaySummary>,
}

pub struct StreamRelay {
    upstream: Arc<dyn Upstream>,
    settings: RelaySettings,
    metrics: Arc<AppMetrics>,
}

impl StreamRelay {
    pub fn new(
        upstream: Arc<dyn Upstream>,
        settings: RelaySettings,
        metrics: Arc<AppMetrics>,
    ) -> Self {
        Self {
            upstream,
            settings,
            metrics,
        }
    }

    pub fn upstream_name(&self) -> &str {
        self.upstream.name()
    }

    /// Relays `request` to `descriptor` and returns the SSE response.
    pub async fn relay(
        &self,
        request: StreamRequest,
        descriptor: &UpstreamDescriptor,
    ) -> Result<RelayHandle, RelayError> {
        let stream = self.open(request, descriptor).await?;
        Ok(RelayHandle {
            response: sse_response(stream.frames, self.settings.keep_alive),
            summary: stream.summary,
        })
    }

    /// Issues the upstream call and starts the producer task. Everything up
    /// to the return of this function is pre-commit.
    pub async fn open(
        &self,
        request: StreamRequest,
        descriptor: &UpstreamDescriptor,
    ) -> Result<RelayStream, RelayError> {
        let started = StdInstant::now();
        let deadline = Instant::now() + descriptor.timeout;
        let mut state = RelayState::Idle;
        transition(&mut state, RelayState::UpstreamPending, request.request_id());

        let response = match timeout_at(deadline, self.upstream.open(&request, descriptor)).await {
            Ok(Ok(response)) => response,
            Ok(Err(error)) => return Err(self.pre_commit_failure(&request, error)),
            Err(_) => {
                return Err(self.pre_commit_failure(
                    &request,
                    RelayError::UpstreamUnavailable(format!(
                        "no response head within {}s",
                        descriptor.timeout.as_secs()
                    )),
                ));
            }
        };

        if !response.is_success() {
            let status = response.status;
            let detail = read_error_body(response.body, deadline).await;
            return Err(self.pre_commit_failure(
                &request,
                RelayError::UpstreamRejected { status, detail },
            ));
        }

        let kind = response.body_kind();
        let upstream_session_id = response.session_id.clone();
        let body = match kind {
            BodyKind::Buffered => {
                transition(&mut state, RelayState::Buffering, request.request_id());
                let bytes = read_buffered_body(
                    response.body,
                    deadline,
                    self.settings.max_buffered_bytes,
                )
                .await
                .map_err(|error| self.pre_commit_failure(&request, error))?;
                PendingBody::Buffered(bytes)
            }
            BodyKind::EventStream | BodyKind::Chunked => {
                transition(&mut state, RelayState::Relaying, request.request_id());
                PendingBody::Streaming(response.body, kind)
            }
        };

        info!(
            request_id = %request.request_id(),
            stage = request.stage().as_str(),
            upstream = self.upstream.name(),
            mode = ?kind,
            "relay committed"
        );

        let (tx, rx) = mpsc::channel(self.settings.channel_capacity.max(1));
        let (summary_tx, summary_rx) = oneshot::channel();
        let channel = RelayChannel::new(tx, deadline, state, request.request_id().to_owned());
        let producer = Producer {
            channel,
            settings: self.settings.clone(),
            metrics: self.metrics.clone(),
            upstream_session_id,
            last_usage: None,
            malformed: 0,
        };
        let guard = self.metrics.active_relay_guard();

        tokio::spawn(async move {
            let _guard = guard;
            let summary = producer.run(body, request, started).await;
            let _ = summary_tx.send(summary);
        });

        Ok(RelayStream {
            frames: ReceiverStream::new(rx),
            summary: summary_rx,
        })
    }

    fn pre_commit_failure(&self, request: &StreamRequest, error: RelayError) -> RelayError {
        self.metrics.observe_relay_error(error.kind(), "pre_commit");
        warn!(
            request_id = %request.request_id(),
            stage = request.stage().as_str(),
            error = %error,
            "upstream failed before streaming started"
        );
        error
    }
}

/// Wraps a frame stream into the SSE response the browser receives.
pub fn sse_response<S>(frames: S, keep_alive: Option<Duration>) -> Response
where
    S: Stream<Item = RelayFrame> + Send + 'static,
{
    let events = frames.map(|frame| Ok::<_, Infallible>(frame.to_event()));
    let sse = Sse::new(events);
    let mut response = match keep_alive {
        Some(interval) => sse
            .keep_alive(KeepAlive::new().interval(interval))
            .into_response(),
        None => sse.into_response(),
    };

    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}

enum PendingBody {
    Streaming(ByteStream, BodyKind),
    Buffered(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelClosed {
    ClientGone,
    Stalled,
}

/// Sending half of one relay. Owns the terminal-frame invariant: once a
/// terminal frame went out, nothing else is sent.
struct RelayChannel {
    tx: mpsc::Sender<RelayFrame>,
    deadline: Instant,
    state: RelayState,
    request_id: String,
    sent: usize,
    terminated: bool,
}

impl RelayChannel {
    fn new(
        tx: mpsc::Sender<RelayFrame>,
        deadline: Instant,
        state: RelayState,
        request_id: String,
    ) -> Self {
        Self {
            tx,
            deadline,
            state,
            request_id,
            sent: 0,
            terminated: false,
        }
    }

    async fn emit(&mut self, frame: RelayFrame) -> Result<(), ChannelClosed> {
        if self.terminated {
            debug!(request_id = %self.request_id, kind = frame.kind(), "frame after terminal dropped");
            return Ok(());
        }
        let terminal = frame.is_terminal();
        match timeout_at(self.deadline, self.tx.send(frame)).await {
            Ok(Ok(())) => {
                self.sent += 1;
                self.terminated = terminal;
                Ok(())
            }
            Ok(Err(_)) => Err(ChannelClosed::ClientGone),
            Err(_) => Err(ChannelClosed::Stalled),
        }
    }

    async fn closed(&self) {
        self.tx.closed().await
    }

    fn transition(&mut self, next: RelayState) {
        transition(&mut self.state, next, &self.request_id);
    }
}

fn transition(state: &mut RelayState, next: RelayState, request_id: &str) {
    debug!(request_id = %request_id, from = ?*state, to = ?next, "relay state");
    *state = next;
}

/// How the upstream read loop ended.
enum Ending {
    Terminal(RelayFrame, RelayOutcome),
    Closed(ChannelClosed),
}

struct Producer {
    channel: RelayChannel,
    settings: RelaySettings,
    metrics: Arc<AppMetrics>,
    upstream_session_id: Option<String>,
    last_usage: Option<Usage>,
    malformed: usize,
}

impl Producer {
    async fn run(
        mut self,
        body: PendingBody,
        request: StreamRequest,
        started: StdInstant,
    ) -> RelaySummary {
        let ending = match self.announce_session().await {
            Err(closed) => Ending::Closed(closed),
            Ok(()) => match body {
                PendingBody::Buffered(bytes) => self.reframe(&bytes).await,
                PendingBody::Streaming(stream, kind) => self.pump(stream, kind).await,
            },
        };

        self.channel.transition(RelayState::Closing);
        let outcome = match ending {
            Ending::Terminal(frame, outcome) => {
                let kind = frame.kind();
                match self.channel.emit(frame).await {
                    Ok(()) => {
                        self.metrics.observe_frame(kind);
                        outcome
                    }
                    Err(closed) => self.closed_early(closed),
                }
            }
            Ending::Closed(closed) => self.closed_early(closed),
        };
        self.channel.transition(RelayState::Closed);

        if let RelayOutcome::Failed(error) = &outcome {
            self.metrics.observe_relay_error(error.kind(), "streaming");
            warn!(
                request_id = %request.request_id(),
                stage = request.stage().as_str(),
                delivered = self.channel.sent,
                error = %error,
                "relay ended with error frame"
            );
        }
        if let Some(usage) = &self.last_usage {
            self.metrics.observe_usage(usage);
        }

        let summary = RelaySummary {
            request_id: request.request_id().to_owned(),
            stage: request.stage(),
            session_token: request.session_token().map(str::to_owned),
            upstream_session_id: self.upstream_session_id,
            outcome,
            usage: self.last_usage,
            frames: self.channel.sent,
            malformed: self.malformed,
            elapsed: started.elapsed(),
        };
        debug!(
            request_id = %summary.request_id,
            outcome = summary.outcome.label(),
            frames = summary.frames,
            malformed = summary.malformed,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "relay closed"
        );
        summary
    }

    fn closed_early(&self, closed: ChannelClosed) -> RelayOutcome {
        self.metrics.observe_client_abort();
        match closed {
            ChannelClosed::ClientGone => {
                info!(request_id = %self.channel.request_id, "client disconnected before stream end");
            }
            ChannelClosed::Stalled => {
                info!(request_id = %self.channel.request_id, "client stopped reading before deadline, closing");
            }
        }
        RelayOutcome::ClientAborted
    }

    async fn announce_session(&mut self) -> Result<(), ChannelClosed> {
        match self.upstream_session_id.clone() {
            Some(session_id) => self.send(RelayFrame::Session { session_id }).await,
            None => Ok(()),
        }
    }

    async fn send(&mut self, frame: RelayFrame) -> Result<(), ChannelClosed> {
        let frame = match frame {
            RelayFrame::Usage(usage) => {
                let usage = usage.completed(&self.settings.pricing);
                self.last_usage = Some(usage.clone());
                RelayFrame::Usage(usage)
            }
            other => other,
        };
        let kind = frame.kind();
        self.channel.emit(frame).await?;
        self.metrics.observe_frame(kind);
        Ok(())
    }

    async fn reframe(&mut self, bytes: &[u8]) -> Ending {
        for frame in reframe_document(bytes) {
            if let Err(closed) = self.send(frame).await {
                return Ending::Closed(closed);
            }
        }
        Ending::Terminal(RelayFrame::Done, RelayOutcome::Completed)
    }

    async fn pump(&mut self, mut body: ByteStream, kind: BodyKind) -> Ending {
        let mut sse = SseDecoder::new(self.settings.max_line_bytes);
        let mut raw = Utf8Chunker::default();
        let deadline = self.channel.deadline;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.channel.closed() => return Ending::Closed(ChannelClosed::ClientGone),
                next = timeout_at(deadline, body.next()) => next,
            };

            let chunk = match next {
                Err(_) => {
                    return interrupted(RelayError::TransportInterrupted(
                        "upstream deadline exceeded mid-stream".to_owned(),
                    ));
                }
                Ok(Some(Err(error))) => {
                    return interrupted(RelayError::TransportInterrupted(error.to_string()));
                }
                Ok(Some(Ok(chunk))) => chunk,
                Ok(None) => {
                    let tail = match kind {
                        BodyKind::EventStream => sse.finish(),
                        _ => vec![text_item(raw.finish())],
                    };
                    if let Some(ending) = self.deliver(tail).await {
                        return ending;
                    }
                    return Ending::Terminal(RelayFrame::Done, RelayOutcome::Completed);
                }
            };

            let items = match kind {
                BodyKind::EventStream => sse.push(&chunk),
                _ => vec![text_item(raw.push(&chunk))],
            };

            if let Some(ending) = self.deliver(items).await {
                return ending;
            }
        }
    }

    /// Sends decoded items in order. Returns an ending when the stream must
    /// stop: an upstream terminal, too many malformed lines, a broken size
    /// limit, or a gone client.
    async fn deliver(&mut self, items: Vec<Decoded>) -> Option<Ending> {
        for item in items {
            match item {
                Decoded::Frames(frames) => {
                    for frame in frames {
                        if frame.is_terminal() {
                            let outcome = match &frame {
                                RelayFrame::Error { message } => RelayOutcome::Failed(
                                    RelayError::UpstreamReported(message.clone()),
                                ),
                                _ => RelayOutcome::Completed,
                            };
                            return Some(Ending::Terminal(frame, outcome));
                        }
                        if let Err(closed) = self.send(frame).await {
                            return Some(Ending::Closed(closed));
                        }
                    }
                }
                Decoded::End => {
                    return Some(Ending::Terminal(RelayFrame::Done, RelayOutcome::Completed));
                }
                Decoded::Ignored => {}
                Decoded::Fatal(error) => {
                    return Some(interrupted(RelayError::TransportInterrupted(
                        error.to_string(),
                    )));
                }
                Decoded::Malformed(detail) => {
                    self.malformed += 1;
                    self.metrics.observe_malformed_frame();
                    debug!(
                        request_id = %self.channel.request_id,
                        malformed = self.malformed,
                        detail = %detail,
                        "skipped malformed upstream line"
                    );
                    if self.malformed > self.settings.malformed_frame_limit {
                        return Some(interrupted(RelayError::TransportInterrupted(format!(
                            "{} malformed lines, last: {detail}",
                            self.malformed
                        ))));
                    }
                }
            }
        }
        None
    }
}

fn interrupted(error: RelayError) -> Ending {
    Ending::Terminal(
        RelayFrame::error(error.user_message()),
        RelayOutcome::Failed(error),
    )
}

fn text_item(text: String) -> Decoded {
    if text.is_empty() {
        Decoded::Ignored
    } else {
        Decoded::Frames(vec![RelayFrame::text(text)])
    }
}

/// Frames for a fully buffered upstream body. Pure, so the same body always
/// yields the same frames.
pub fn reframe_document(bytes: &[u8]) -> Vec<RelayFrame> {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(payload) => {
            let usage = payload
                .get("usage")
                .and_then(|usage| serde_json::from_value::<Usage>(usage.clone()).ok());
            let mut frames = vec![RelayFrame::Document { payload }];
            if let Some(usage) = usage {
                frames.push(RelayFrame::Usage(usage));
            }
            frames
        }
        Err(_) => {
            let text = String::from_utf8_lossy(bytes);
            if text.trim().is_empty() {
                Vec::new()
            } else {
                vec![RelayFrame::text(text.into_owned())]
            }
        }
    }
}

async fn read_buffered_body(
    mut body: ByteStream,
    deadline: Instant,
    limit: usize,
) -> Result<Vec<u8>, RelayError> {
    let mut buffer = Vec::new();
    loop {
        match timeout_at(deadline, body.next()).await {
            Err(_) => {
                return Err(RelayError::UpstreamUnavailable(
                    "timed out reading buffered upstream body".to_owned(),
                ));
            }
            Ok(None) => return Ok(buffer),
            Ok(Some(Err(error))) => {
                return Err(RelayError::UpstreamUnavailable(format!(
                    "buffered upstream body interrupted: {error}"
                )));
            }
            Ok(Some(Ok(chunk))) => {
                if buffer.len() + chunk.len() > limit {
                    return Err(RelayError::MalformedUpstreamFrame(format!(
                        "buffered upstream body exceeded {limit} bytes"
                    )));
                }
                buffer.extend_from_slice(&chunk);
            }
        }
    }
}

/// Best-effort excerpt of a rejected response for the logs.
async fn read_error_body(mut body: ByteStream, deadline: Instant) -> String {
    const LIMIT: usize = 400;
    let mut buffer = Vec::new();
    while buffer.len() < LIMIT {
        match timeout_at(deadline, body.next()).await {
            Ok(Some(Ok(chunk))) => buffer.extend_from_slice(&chunk),
            _ => break,
        }
    }
    String::from_utf8_lossy(&buffer)
        .chars()
        .take(LIMIT)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::{
        pin::Pin,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Mutex,
        },
        task::{Context, Poll},
    };

    use async_trait::async_trait;
    use axum::body::{to_bytes, Bytes};
    use serde_json::{json, Map};
    use tokio::time::{sleep, timeout};

    use super::*;
    use crate::upstream::{
        mock::{MockChunk, MockReply, MockUpstream},
        SessionConvention, TransportError, UpstreamResponse,
    };

    fn descriptor(timeout: Duration) -> UpstreamDescriptor {
        UpstreamDescriptor {
            base_url: "mock://local".to_owned(),
            path: "/v1/wizard/problem".to_owned(),
            headers: Vec::new(),
            timeout,
            session: SessionConvention::None,
            session_response_header: None,
        }
    }

    fn request() -> StreamRequest {
        let mut payload = Map::new();
        payload.insert("inputs".to_owned(), json!({"problemStatement": "triage"}));
        StreamRequest::new(WizardStage::Problem, Some("wizard_1".to_owned()), payload)
    }

    fn relay_with(upstream: Arc<dyn Upstream>, settings: RelaySettings) -> StreamRelay {
        StreamRelay::new(upstream, settings, Arc::new(AppMetrics::new()))
    }

    fn scripted(replies: Vec<MockReply>) -> StreamRelay {
        relay_with(
            Arc::new(MockUpstream::scripted(replies)),
            RelaySettings::default(),
        )
    }

    async fn run(relay: &StreamRelay, timeout: Duration) -> (Vec<RelayFrame>, RelaySummary) {
        let stream = relay
            .open(request(), &descriptor(timeout))
            .await
            .expect("relay should commit");
        let frames = stream.frames.collect::<Vec<_>>().await;
        let summary = stream.summary.await.expect("summary should be sent");
        (frames, summary)
    }

    fn assert_single_terminal_at_end(frames: &[RelayFrame]) {
        let terminals = frames.iter().filter(|frame| frame.is_terminal()).count();
        assert_eq!(terminals, 1, "exactly one terminal frame: {frames:?}");
        assert!(
            frames.last().is_some_and(RelayFrame::is_terminal),
            "terminal frame must be last: {frames:?}"
        );
    }

    fn texts(frames: &[RelayFrame]) -> Vec<&str> {
        frames
            .iter()
            .filter_map(|frame| match frame {
                RelayFrame::TextDelta { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn sse_upstream_is_relayed_in_order_and_closed_with_done() {
        let relay = scripted(vec![MockReply::sse([
            "data: {\"text\":\"Hello\"}\n\n",
            "data: {\"text\":\" world\"}\n\n",
        ])]);

        let (frames, summary) = run(&relay, Duration::from_secs(5)).await;

        assert_eq!(
            frames,
            vec![
                RelayFrame::text("Hello"),
                RelayFrame::text(" world"),
                RelayFrame::Done
            ]
        );
        assert_eq!(texts(&frames).concat(), "Hello world");
        assert_eq!(summary.outcome, RelayOutcome::Completed);
        assert_eq!(summary.frames, 3);
    }

    #[tokio::test]
    async fn single_malformed_line_is_skipped() {
        let relay = scripted(vec![MockReply::sse([
            "data: {\"text\":\"a\"}\n\n",
            "data: {not json\n\n",
            "data: {\"text\":\"b\"}\n\n",
        ])]);

        let (frames, summary) = run(&relay, Duration::from_secs(5)).await;

        assert_eq!(
            frames,
            vec![RelayFrame::text("a"), RelayFrame::text("b"), RelayFrame::Done]
        );
        assert_eq!(summary.malformed, 1);
    }

    #[tokio::test]
    async fn recurring_malformed_lines_escalate_to_error() {
        let relay = relay_with(
            Arc::new(MockUpstream::scripted(vec![MockReply::sse([
                "data: {\"text\":\"kept\"}\n\n",
                "junk one\n",
                "junk two\n",
                "junk three\n",
                "data: {\"text\":\"never\"}\n\n",
            ])])),
            RelaySettings {
                malformed_frame_limit: 2,
                ..RelaySettings::default()
            },
        );

        let (frames, summary) = run(&relay, Duration::from_secs(5)).await;

        assert_single_terminal_at_end(&frames);
        assert_eq!(texts(&frames), vec!["kept"]);
        assert_eq!(
            frames.last(),
            Some(&RelayFrame::error(
                "The connection to the model service was interrupted."
            ))
        );
        assert!(matches!(
            &summary.outcome,
            RelayOutcome::Failed(RelayError::TransportInterrupted(detail))
                if detail.starts_with("3 malformed lines")
        ));
        assert_eq!(summary.malformed, 3);
    }

    #[tokio::test]
    async fn content_before_an_oversized_line_is_delivered() {
        let mut chunk = b"data: {\"text\":\"kept\"}\n\n".to_vec();
        chunk.extend(std::iter::repeat(b'x').take(2048));
        let relay = relay_with(
            Arc::new(MockUpstream::scripted(vec![MockReply::chunks(
                Some("text/event-stream"),
                vec![MockChunk::Bytes(chunk)],
            )])),
            RelaySettings {
                max_line_bytes: 1024,
                ..RelaySettings::default()
            },
        );

        let (frames, summary) = run(&relay, Duration::from_secs(5)).await;

        assert_eq!(
            frames,
            vec![
                RelayFrame::text("kept"),
                RelayFrame::error("The connection to the model service was interrupted."),
            ]
        );
        assert!(matches!(
            summary.outcome,
            RelayOutcome::Failed(RelayError::TransportInterrupted(_))
        ));
    }

    #[tokio::test]
    async fn reset_after_partial_content_appends_one_error() {
        let relay = scripted(vec![MockReply::chunks(
            Some("text/event-stream"),
            vec![
                MockChunk::Bytes(b"data: {\"text\":\"a\"}\n\n".to_vec()),
                MockChunk::Bytes(b"data: {\"text\":\"b\"}\n\n".to_vec()),
                MockChunk::Bytes(b"data: {\"text\":\"c\"}\n\n".to_vec()),
                MockChunk::Fail("connection reset by peer".to_owned()),
            ],
        )]);

        let (frames, summary) = run(&relay, Duration::from_secs(5)).await;

        assert_eq!(
            frames,
            vec![
                RelayFrame::text("a"),
                RelayFrame::text("b"),
                RelayFrame::text("c"),
                RelayFrame::error("The connection to the model service was interrupted."),
            ]
        );
        assert!(!frames.contains(&RelayFrame::Done));
        assert!(matches!(
            summary.outcome,
            RelayOutcome::Failed(RelayError::TransportInterrupted(_))
        ));
    }

    #[tokio::test]
    async fn stalled_upstream_times_out_into_error_frame() {
        let relay = scripted(vec![MockReply::chunks(
            Some("text/event-stream"),
            vec![
                MockChunk::Bytes(b"data: {\"text\":\"partial\"}\n\n".to_vec()),
                MockChunk::Stall,
            ],
        )]);

        let (frames, summary) = run(&relay, Duration::from_millis(150)).await;

        assert_eq!(frames[0], RelayFrame::text("partial"));
        assert_single_terminal_at_end(&frames);
        assert!(matches!(frames[1], RelayFrame::Error { .. }));
        assert!(matches!(summary.outcome, RelayOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn frames_after_upstream_terminal_are_not_relayed() {
        let relay = scripted(vec![MockReply::sse([
            "data: {\"text\":\"only\"}\n\ndata: {\"type\":\"done\"}\n\ndata: {\"text\":\"late\"}\n\n",
        ])]);

        let (frames, _) = run(&relay, Duration::from_secs(5)).await;

        assert_eq!(frames, vec![RelayFrame::text("only"), RelayFrame::Done]);
    }

    #[tokio::test]
    async fn upstream_error_event_is_the_only_terminal() {
        let relay = scripted(vec![MockReply::sse([
            "data: {\"text\":\"draft\"}\n\n",
            "data: {\"error\":{\"message\":\"quota exhausted\"}}\n\n",
            "data: [DONE]\n\n",
        ])]);

        let (frames, summary) = run(&relay, Duration::from_secs(5)).await;

        assert_eq!(
            frames,
            vec![RelayFrame::text("draft"), RelayFrame::error("quota exhausted")]
        );
        assert_eq!(
            summary.outcome,
            RelayOutcome::Failed(RelayError::UpstreamReported("quota exhausted".to_owned()))
        );
    }

    #[tokio::test]
    async fn native_error_frame_without_message_is_not_swallowed() {
        let relay = scripted(vec![MockReply::sse([
            "data: {\"text\":\"draft\"}\n\n",
            "data: {\"type\":\"error\",\"detail\":\"boom\"}\n\n",
        ])]);

        let (frames, summary) = run(&relay, Duration::from_secs(5)).await;

        assert_single_terminal_at_end(&frames);
        assert_eq!(
            frames.last(),
            Some(&RelayFrame::error("The model service reported an error."))
        );
        assert!(!frames.contains(&RelayFrame::Done));
        assert!(matches!(
            summary.outcome,
            RelayOutcome::Failed(RelayError::UpstreamReported(_))
        ));
    }

    #[tokio::test]
    async fn raw_chunks_are_wrapped_as_text_deltas() {
        let relay = scripted(vec![MockReply::chunks(
            Some("text/plain; charset=utf-8"),
            vec![
                MockChunk::Bytes(b"Hel".to_vec()),
                MockChunk::Bytes(b"lo \xC3".to_vec()),
                MockChunk::Bytes(vec![0xA9]),
            ],
        )]);

        let (frames, _) = run(&relay, Duration::from_secs(5)).await;

        assert_eq!(
            frames,
            vec![
                RelayFrame::text("Hel"),
                RelayFrame::text("lo "),
                RelayFrame::text("é"),
                RelayFrame::Done
            ]
        );
    }

    #[tokio::test]
    async fn session_and_usage_are_threaded_through() {
        let relay = scripted(vec![MockReply::sse([
            "data: {\"text\":\"x\"}\n\n",
            "data: {\"usage\":{\"input_tokens\":1000000,\"output_tokens\":0}}\n\n",
            "data: [DONE]\n\n",
        ])
        .with_session("up-7")]);

        let (frames, summary) = run(&relay, Duration::from_secs(5)).await;

        assert_eq!(
            frames[0],
            RelayFrame::Session {
                session_id: "up-7".to_owned()
            }
        );
        let RelayFrame::Usage(usage) = &frames[2] else {
            panic!("expected usage frame, got {frames:?}");
        };
        assert_eq!(usage.total_tokens, 1_000_000);
        assert!((usage.estimated_cost_usd - 3.0).abs() < 1e-9);
        assert_eq!(frames.last(), Some(&RelayFrame::Done));
        assert_eq!(summary.upstream_session_id.as_deref(), Some("up-7"));
        assert_eq!(summary.usage.as_ref(), Some(usage));
    }

    #[tokio::test]
    async fn echo_fallback_streams_text_progress_and_usage() {
        let relay = scripted(Vec::new());

        let (frames, summary) = run(&relay, Duration::from_secs(5)).await;

        assert_eq!(
            frames[0],
            RelayFrame::Session {
                session_id: "mock-wizard_1".to_owned()
            }
        );
        assert_eq!(texts(&frames).concat(), "Mock problem output for: triage");
        assert!(frames
            .iter()
            .any(|frame| matches!(frame, RelayFrame::Progress { .. })));
        let usage = summary.usage.expect("echo reports usage");
        assert_eq!(usage.output_tokens, 5);
        assert_eq!(usage.total_tokens, usage.input_tokens + 5);
        assert!(usage.estimated_cost_usd > 0.0);
        assert_eq!(frames.last(), Some(&RelayFrame::Done));
    }

    #[tokio::test]
    async fn buffered_json_is_reframed_identically_every_time() {
        let body = r#"{"score":7,"dimensions":{"data":3,"risk":2},"usage":{"inputTokens":10,"outputTokens":2}}"#;
        let relay = scripted(vec![MockReply::json(200, body), MockReply::json(200, body)]);

        let mut rendered = Vec::new();
        for _ in 0..2 {
            let stream = relay
                .open(request(), &descriptor(Duration::from_secs(5)))
                .await
                .expect("relay should commit");
            let response = sse_response(stream.frames, None);
            let bytes = to_bytes(response.into_body(), usize::MAX)
                .await
                .expect("body should be readable");
            rendered.push(bytes);
        }

        assert_eq!(rendered[0], rendered[1]);
        let text = String::from_utf8(rendered[0].to_vec()).expect("utf-8 body");
        let document = text.find("{\"type\":\"document\"").expect("document frame");
        let usage = text.find("{\"type\":\"usage\"").expect("usage frame");
        let done = text.find("{\"type\":\"done\"}").expect("done frame");
        assert!(document < usage && usage < done);
    }

    #[test]
    fn unparseable_buffered_body_is_forwarded_as_text() {
        assert_eq!(
            reframe_document(b"<html>upstream says hi</html>"),
            vec![RelayFrame::text("<html>upstream says hi</html>")]
        );
        assert!(reframe_document(b"  ").is_empty());
    }

    #[tokio::test]
    async fn non_success_status_fails_before_commit() {
        let relay = scripted(vec![MockReply::json(503, r#"{"message":"overloaded"}"#)]);

        let error = relay
            .open(request(), &descriptor(Duration::from_secs(5)))
            .await
            .err()
            .expect("503 should not commit");

        assert_eq!(
            error,
            RelayError::UpstreamRejected {
                status: 503,
                detail: r#"{"message":"overloaded"}"#.to_owned()
            }
        );
    }

    #[tokio::test]
    async fn unreachable_upstream_fails_before_commit() {
        let relay = scripted(vec![MockReply::Unreachable("connection refused".to_owned())]);

        let error = relay
            .open(request(), &descriptor(Duration::from_secs(5)))
            .await
            .err()
            .expect("unreachable upstream should not commit");

        assert!(matches!(error, RelayError::UpstreamUnavailable(_)));
    }

    struct HangingUpstream;

    #[async_trait]
    impl Upstream for HangingUpstream {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn open(
            &self,
            _request: &StreamRequest,
            _descriptor: &UpstreamDescriptor,
        ) -> Result<UpstreamResponse, RelayError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn missing_response_head_times_out_before_commit() {
        let relay = relay_with(Arc::new(HangingUpstream), RelaySettings::default());

        let error = relay
            .open(request(), &descriptor(Duration::from_millis(50)))
            .await
            .err()
            .expect("hanging upstream should time out");

        assert!(matches!(error, RelayError::UpstreamUnavailable(_)));
    }

    /// Endless upstream that records how often it was polled and whether it
    /// was dropped.
    struct CountingBody {
        reads: Arc<AtomicUsize>,
        dropped: Arc<AtomicBool>,
    }

    impl Stream for CountingBody {
        type Item = Result<Bytes, TransportError>;

        fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Poll::Ready(Some(Ok(Bytes::from_static(b"data: {\"text\":\"tick\"}\n\n"))))
        }
    }

    impl Drop for CountingBody {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    struct OnceUpstream(Mutex<Option<UpstreamResponse>>);

    #[async_trait]
    impl Upstream for OnceUpstream {
        fn name(&self) -> &str {
            "once"
        }

        async fn open(
            &self,
            _request: &StreamRequest,
            _descriptor: &UpstreamDescriptor,
        ) -> Result<UpstreamResponse, RelayError> {
            self.0
                .lock()
                .expect("upstream lock")
                .take()
                .ok_or_else(|| RelayError::UpstreamUnavailable("already used".to_owned()))
        }
    }

    fn counting_relay(
        channel_capacity: usize,
    ) -> (StreamRelay, Arc<AtomicUsize>, Arc<AtomicBool>) {
        let reads = Arc::new(AtomicUsize::new(0));
        let dropped = Arc::new(AtomicBool::new(false));
        let body = CountingBody {
            reads: reads.clone(),
            dropped: dropped.clone(),
        };
        let upstream = OnceUpstream(Mutex::new(Some(UpstreamResponse {
            status: 200,
            content_type: Some("text/event-stream".to_owned()),
            session_id: None,
            body: body.boxed(),
        })));
        let relay = relay_with(
            Arc::new(upstream),
            RelaySettings {
                channel_capacity,
                ..RelaySettings::default()
            },
        );
        (relay, reads, dropped)
    }

    #[tokio::test]
    async fn client_abort_stops_upstream_reads() {
        let (relay, reads, dropped) = counting_relay(1);
        let RelayStream {
            mut frames,
            summary,
        } = relay
            .open(request(), &descriptor(Duration::from_secs(30)))
            .await
            .expect("relay should commit");

        assert_eq!(frames.next().await, Some(RelayFrame::text("tick")));
        assert_eq!(frames.next().await, Some(RelayFrame::text("tick")));
        drop(frames);

        let summary = timeout(Duration::from_secs(2), summary)
            .await
            .expect("producer should stop promptly")
            .expect("summary should be sent");
        assert_eq!(summary.outcome, RelayOutcome::ClientAborted);
        assert!(dropped.load(Ordering::SeqCst), "upstream body should be released");

        let settled = reads.load(Ordering::SeqCst);
        sleep(Duration::from_millis(30)).await;
        assert_eq!(reads.load(Ordering::SeqCst), settled);
    }

    #[tokio::test]
    async fn slow_client_applies_backpressure_and_deadline_releases_it() {
        let (relay, reads, dropped) = counting_relay(2);
        let RelayStream { frames, summary } = relay
            .open(request(), &descriptor(Duration::from_millis(100)))
            .await
            .expect("relay should commit");

        sleep(Duration::from_millis(20)).await;
        // channel capacity plus the chunk the producer is blocked on
        assert!(reads.load(Ordering::SeqCst) <= 3);

        let summary = timeout(Duration::from_secs(2), summary)
            .await
            .expect("deadline should end the producer")
            .expect("summary should be sent");
        assert_eq!(summary.outcome, RelayOutcome::ClientAborted);
        assert!(dropped.load(Ordering::SeqCst));
        drop(frames);
    }
}
