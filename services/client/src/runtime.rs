//! The chat runtime: one task that owns the conversation.
//!
//! `ChatRuntime::run` drains a single event queue. Connection notices, typed
//! input, recognition callbacks, playback completion, and timer expirations all
//! arrive as `ChatEvent`s, so the session, the stream assembler, and the voice
//! coordinator are only ever touched from this one task. What the user should
//! see goes out as `Notice`s.

use chrono::Utc;
use paco_core::{
    Credentials,
    api::{PacoApi, Provider, SaveMessageRequest},
    assembler::{Dispatch, StreamAssembler},
    message::Message,
    session::{ConversationSession, SessionError},
    voice::{EndReason, RecognitionErrorKind, VoiceCoordinator, VoiceEffect},
};
use paco_realtime::{ConnectionEvent, ConnectionManager};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::mpsc,
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, info, instrument, warn};

const CLOCK_TICK: Duration = Duration::from_secs(1);
/// How long a clean shutdown waits for transcript saves still in flight.
const MIRROR_GRACE: Duration = Duration::from_secs(2);

/// Callbacks from a speech recognizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    Result(String),
    End,
    Error(RecognitionErrorKind),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    Connection(ConnectionEvent),
    UserInput(String),
    StartCall,
    EndCall,
    Recognition(RecognitionEvent),
    PlaybackEnded,
    RestartDue(u64),
    ClockTick,
    Shutdown,
}

/// What the front-end should show.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    Connected,
    Disconnected,
    ConnectionError(String),
    History(Vec<Message>),
    /// A user message went out.
    Sent(Message),
    /// A user message was kept locally but could not be sent.
    NotSent(Message),
    /// Input was refused before anything was sent.
    Rejected(SessionError),
    Partial(String),
    Reply(Message),
    UpstreamError(String),
    CallStarted,
    CallUnavailable(String),
    CallWarning { remaining: Duration },
    CallEnded(EndReason),
}

/// Cloneable entry point into a runtime's event queue.
#[derive(Debug, Clone)]
pub struct ChatHandle {
    tx: mpsc::UnboundedSender<ChatEvent>,
}

impl ChatHandle {
    /// Queues `event`. Returns `false` once the runtime is gone.
    pub fn post(&self, event: ChatEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.post(ChatEvent::UserInput(text.into()))
    }

    pub fn start_call(&self) -> bool {
        self.post(ChatEvent::StartCall)
    }

    pub fn end_call(&self) -> bool {
        self.post(ChatEvent::EndCall)
    }

    pub fn recognition(&self, event: RecognitionEvent) -> bool {
        self.post(ChatEvent::Recognition(event))
    }

    pub fn playback_ended(&self) -> bool {
        self.post(ChatEvent::PlaybackEnded)
    }

    pub fn shutdown(&self) -> bool {
        self.post(ChatEvent::Shutdown)
    }
}

/// Creates the event queue a runtime drains. Devices that report back
/// asynchronously (such as an audio output) take a clone of the handle.
pub fn event_channel() -> (ChatHandle, mpsc::UnboundedReceiver<ChatEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChatHandle { tx }, rx)
}

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub model: String,
    pub history_limit: u32,
    pub mirror_transcripts: bool,
}

pub struct RuntimeParts {
    pub credentials: Credentials,
    pub api: Arc<dyn PacoApi>,
    pub connection: ConnectionManager,
    pub voice: VoiceCoordinator,
    pub options: RuntimeOptions,
    pub handle: ChatHandle,
    pub events: mpsc::UnboundedReceiver<ChatEvent>,
}

pub struct ChatRuntime {
    credentials: Credentials,
    api: Arc<dyn PacoApi>,
    connection: ConnectionManager,
    voice: VoiceCoordinator,
    options: RuntimeOptions,
    handle: ChatHandle,
    events: mpsc::UnboundedReceiver<ChatEvent>,
    notices: mpsc::UnboundedSender<Notice>,
    session: ConversationSession,
    assembler: StreamAssembler,
    restart_timer: Option<JoinHandle<()>>,
    call_clock: Option<JoinHandle<()>>,
    mirrors: JoinSet<()>,
}

impl ChatRuntime {
    pub fn new(parts: RuntimeParts) -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (notices, notices_rx) = mpsc::unbounded_channel();
        let session = ConversationSession::new(&parts.credentials.research_id, Utc::now());
        let runtime = Self {
            credentials: parts.credentials,
            api: parts.api,
            connection: parts.connection,
            voice: parts.voice,
            options: parts.options,
            handle: parts.handle,
            events: parts.events,
            notices,
            session,
            assembler: StreamAssembler::new(),
            restart_timer: None,
            call_clock: None,
            mirrors: JoinSet::new(),
        };
        (runtime, notices_rx)
    }

    pub fn conversation_id(&self) -> &str {
        self.session.conversation_id()
    }

    /// Connects, loads history, then processes events until `Shutdown`.
    #[instrument(skip_all, fields(conversation_id = %self.session.conversation_id()))]
    pub async fn run(mut self) {
        let handle = self.handle.clone();
        self.connection
            .set_listener(Arc::new(move |event: ConnectionEvent| {
                handle.post(ChatEvent::Connection(event));
            }));
        self.connection.connect();

        let loaded = self
            .session
            .load_history(
                self.api.as_ref(),
                &self.credentials.token,
                self.options.history_limit,
            )
            .await;
        if loaded > 0 {
            self.notify(Notice::History(self.session.messages().to_vec()));
        }

        info!("Chat runtime started.");
        while let Some(event) = self.events.recv().await {
            if event == ChatEvent::Shutdown {
                break;
            }
            self.handle_event(event);
        }

        // Saves still in flight get a short grace period; Drop aborts the rest.
        let pending = self.mirrors.len();
        if pending > 0 {
            let drained = tokio::time::timeout(MIRROR_GRACE, async {
                while self.mirrors.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(pending = self.mirrors.len(), "Abandoning unsaved transcript mirrors.");
            }
        }
        info!(
            messages = self.session.messages().len(),
            dropped_frames = self.assembler.dropped(),
            "Chat runtime stopped."
        );
    }

    fn handle_event(&mut self, event: ChatEvent) {
        match event {
            ChatEvent::Connection(event) => self.on_connection(event),
            ChatEvent::UserInput(text) => self.submit(&text),
            ChatEvent::StartCall => match self.voice.start_call() {
                Ok(effects) => {
                    if !effects.is_empty() {
                        self.notify(Notice::CallStarted);
                    }
                    self.apply(effects);
                }
                Err(e) => {
                    warn!(error = %e, "Call could not start.");
                    self.notify(Notice::CallUnavailable(e.to_string()));
                }
            },
            ChatEvent::EndCall => {
                let effects = self.voice.end_call(EndReason::User);
                self.apply(effects);
            }
            ChatEvent::Recognition(event) => {
                let effects = match event {
                    RecognitionEvent::Result(text) => self.voice.on_recognition_result(&text),
                    RecognitionEvent::End => self.voice.on_recognition_end(),
                    RecognitionEvent::Error(kind) => self.voice.on_recognition_error(kind),
                };
                self.apply(effects);
            }
            ChatEvent::PlaybackEnded => {
                let effects = self.voice.on_playback_ended();
                self.apply(effects);
            }
            ChatEvent::RestartDue(epoch) => {
                let effects = self.voice.on_restart_due(epoch);
                self.apply(effects);
            }
            ChatEvent::ClockTick => {
                let effects = self.voice.advance_clock(CLOCK_TICK);
                self.apply(effects);
            }
            ChatEvent::Shutdown => {}
        }
    }

    fn on_connection(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Opened => self.notify(Notice::Connected),
            ConnectionEvent::Closed => {
                // A reply cannot arrive on a channel that is gone.
                if self.session.is_responding() {
                    self.session.abandon_reply();
                }
                self.notify(Notice::Disconnected);
            }
            ConnectionEvent::Error(e) => self.notify(Notice::ConnectionError(e)),
            ConnectionEvent::Message(raw) => self.on_frame(&raw),
        }
    }

    fn on_frame(&mut self, raw: &str) {
        match self.assembler.dispatch(raw, &mut self.session, Utc::now()) {
            Dispatch::Ignored => {}
            Dispatch::Partial(text) => self.notify(Notice::Partial(text)),
            Dispatch::Committed(message) => {
                self.mirror(&message);
                self.notify(Notice::Reply(message));
            }
            Dispatch::Play(clip) => {
                let effects = self.voice.on_audio(clip);
                self.apply(effects);
            }
            Dispatch::Acknowledged => debug!("User message saved by backend."),
            Dispatch::UpstreamError(e) => self.notify(Notice::UpstreamError(e)),
        }
    }

    fn submit(&mut self, text: &str) {
        let result = self.session.append_user_message(
            text,
            &self.credentials,
            &self.options.model,
            &self.connection,
            Utc::now(),
        );
        match result {
            Ok(turn) if turn.delivered => {
                self.mirror(&turn.message);
                self.notify(Notice::Sent(turn.message));
            }
            Ok(turn) => self.notify(Notice::NotSent(turn.message)),
            Err(e) => {
                debug!(error = %e, "Input refused.");
                self.notify(Notice::Rejected(e));
            }
        }
    }

    fn apply(&mut self, effects: Vec<VoiceEffect>) {
        for effect in effects {
            match effect {
                VoiceEffect::StartClock => {
                    abort(&mut self.call_clock);
                    let handle = self.handle.clone();
                    self.call_clock = Some(tokio::spawn(async move {
                        let mut ticker = tokio::time::interval(CLOCK_TICK);
                        // The first tick completes immediately.
                        ticker.tick().await;
                        loop {
                            ticker.tick().await;
                            if !handle.post(ChatEvent::ClockTick) {
                                break;
                            }
                        }
                    }));
                }
                VoiceEffect::StopClock => abort(&mut self.call_clock),
                VoiceEffect::ScheduleRestart { delay, epoch } => {
                    abort(&mut self.restart_timer);
                    let handle = self.handle.clone();
                    self.restart_timer = Some(tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        handle.post(ChatEvent::RestartDue(epoch));
                    }));
                }
                VoiceEffect::Submit(text) => self.submit(&text),
                VoiceEffect::Warning { remaining } => {
                    self.notify(Notice::CallWarning { remaining })
                }
                VoiceEffect::Ended(reason) => {
                    abort(&mut self.restart_timer);
                    self.notify(Notice::CallEnded(reason));
                }
            }
        }
    }

    /// Saves a committed turn through the REST API when mirroring is on.
    fn mirror(&mut self, message: &Message) {
        if !self.options.mirror_transcripts {
            return;
        }
        // Reap finished saves so the set only holds in-flight ones.
        while self.mirrors.try_join_next().is_some() {}
        let api = self.api.clone();
        let token = self.credentials.token.clone();
        let request = SaveMessageRequest {
            research_id: self.credentials.research_id.clone(),
            role: message.role,
            content: message.content.clone(),
            timestamp: message.timestamp.unwrap_or_else(Utc::now),
            provider: Provider::OpenAi,
            elevenlabs_conversation_id: None,
            elevenlabs_message_id: None,
        };
        self.mirrors.spawn(async move {
            match api.save_message(&token, request).await {
                Ok(ack) => debug!(message_id = ack.message_id, "Transcript mirrored."),
                Err(e) => warn!(error = %e, "Failed to mirror transcript."),
            }
        });
    }

    fn notify(&self, notice: Notice) {
        // The front-end may already be gone during shutdown.
        let _ = self.notices.send(notice);
    }
}

fn abort(timer: &mut Option<JoinHandle<()>>) {
    if let Some(timer) = timer.take() {
        timer.abort();
    }
}

impl Drop for ChatRuntime {
    fn drop(&mut self) {
        abort(&mut self.restart_timer);
        abort(&mut self.call_clock);
        self.mirrors.abort_all();
        self.voice.shutdown();
        self.connection.clear_listener();
        self.connection.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockApi;
    use async_trait::async_trait;
    use paco_core::{
        api::{
            AccessToken, ApiError, DisclaimerAcknowledgment, HistoryPage, HistoryRequest,
            ResearchIdValidation, SaveMessageAck,
        },
        message::Role,
        voice::{AudioClip, AudioOutput, CallLimits, PlaybackError, RecognizerError, SpeechRecognizer},
    };
    use paco_realtime::{
        ConnectionConfig, Transport, TransportError,
        transport::{FrameSink, FrameStream, OpenChannel},
    };
    use std::sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    /// A backend reachable only through channels held by the test.
    struct FakeBackend {
        accept: bool,
        dials: AtomicUsize,
        inbound: Mutex<Option<mpsc::UnboundedReceiver<Result<String, TransportError>>>>,
        requests: mpsc::UnboundedSender<serde_json::Value>,
    }

    struct ToBackend(mpsc::UnboundedSender<serde_json::Value>);
    struct FromBackend(mpsc::UnboundedReceiver<Result<String, TransportError>>);

    #[async_trait]
    impl FrameSink for ToBackend {
        async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
            let value = serde_json::from_str(&text).unwrap();
            let _ = self.0.send(value);
            Ok(())
        }
        async fn close(&mut self) {}
    }

    #[async_trait]
    impl FrameStream for FromBackend {
        async fn next_text(&mut self) -> Option<Result<String, TransportError>> {
            self.0.recv().await
        }
    }

    #[async_trait]
    impl Transport for FakeBackend {
        async fn open(&self, url: &str) -> Result<OpenChannel, TransportError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let inbound = if self.accept {
                self.inbound.lock().unwrap().take()
            } else {
                None
            };
            match inbound {
                Some(inbound) => Ok((
                    Box::new(ToBackend(self.requests.clone())),
                    Box::new(FromBackend(inbound)),
                )),
                None => Err(TransportError::Connect {
                    url: url.to_string(),
                    reason: "connection refused".to_string(),
                }),
            }
        }
    }

    struct Server {
        frames: mpsc::UnboundedSender<Result<String, TransportError>>,
        requests: mpsc::UnboundedReceiver<serde_json::Value>,
    }

    impl Server {
        fn push(&self, frame: serde_json::Value) {
            self.frames.send(Ok(frame.to_string())).unwrap();
        }
    }

    fn backend(accept: bool) -> (Arc<FakeBackend>, Server) {
        let (frames, inbound) = mpsc::unbounded_channel();
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let backend = Arc::new(FakeBackend {
            accept,
            dials: AtomicUsize::new(0),
            inbound: Mutex::new(Some(inbound)),
            requests: requests_tx,
        });
        (backend, Server { frames, requests })
    }

    struct Recognizer {
        supported: bool,
        starts: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
    }

    impl SpeechRecognizer for Recognizer {
        fn is_supported(&self) -> bool {
            self.supported
        }
        fn start(&mut self) -> Result<(), RecognizerError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn stop(&mut self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Finishes every clip as soon as it starts.
    struct InstantOutput {
        handle: ChatHandle,
        played: Arc<Mutex<Vec<AudioClip>>>,
    }

    impl AudioOutput for InstantOutput {
        fn play(&mut self, clip: AudioClip) -> Result<(), PlaybackError> {
            self.played.lock().unwrap().push(clip);
            self.handle.playback_ended();
            Ok(())
        }
        fn stop(&mut self) {}
    }

    struct Harness {
        handle: ChatHandle,
        notices: mpsc::UnboundedReceiver<Notice>,
        server: Server,
        backend: Arc<FakeBackend>,
        starts: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
        played: Arc<Mutex<Vec<AudioClip>>>,
        task: JoinHandle<()>,
    }

    fn empty_history() -> MockApi {
        let mut api = MockApi::new();
        api.expect_get_history().returning(|_, request| {
            Ok(HistoryPage {
                messages: vec![],
                total: 0,
                research_id: request.research_id,
            })
        });
        api
    }

    fn start(
        api: impl PacoApi + 'static,
        accept: bool,
        recognizer_supported: bool,
        mirror: bool,
    ) -> Harness {
        let (transport, server) = backend(accept);
        let (handle, events) = event_channel();
        let starts = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));
        let played = Arc::new(Mutex::new(Vec::new()));
        let voice = VoiceCoordinator::new(
            Box::new(Recognizer {
                supported: recognizer_supported,
                starts: starts.clone(),
                stops: stops.clone(),
            }),
            Box::new(InstantOutput {
                handle: handle.clone(),
                played: played.clone(),
            }),
            CallLimits::default(),
        );
        let connection = ConnectionManager::new(
            ConnectionConfig {
                url: "ws://test/chat".to_string(),
                reconnect_delay: Duration::from_millis(3000),
            },
            transport.clone(),
        );
        let (runtime, notices) = ChatRuntime::new(RuntimeParts {
            credentials: Credentials {
                token: "tok".to_string(),
                research_id: "PACO001".to_string(),
            },
            api: Arc::new(api),
            connection,
            voice,
            options: RuntimeOptions {
                model: "gpt-4o".to_string(),
                history_limit: 50,
                mirror_transcripts: mirror,
            },
            handle: handle.clone(),
            events,
        });
        let task = tokio::spawn(runtime.run());
        Harness {
            handle,
            notices,
            server,
            backend: transport,
            starts,
            stops,
            played,
            task,
        }
    }

    impl Harness {
        async fn next(&mut self) -> Notice {
            self.notices.recv().await.expect("runtime stopped")
        }

        /// Skips notices until one matches.
        async fn until(&mut self, wanted: impl Fn(&Notice) -> bool) -> Notice {
            loop {
                let notice = self.next().await;
                if wanted(&notice) {
                    return notice;
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_streamed_reply_commits_final_text() {
        let mut h = start(empty_history(), true, false, false);
        assert_eq!(h.next().await, Notice::Connected);

        h.handle.send_text("What is PAD?");
        match h.next().await {
            Notice::Sent(message) => assert_eq!(message.content, "What is PAD?"),
            other => panic!("Expected Sent, got {:?}", other),
        }

        let request = h.server.requests.recv().await.unwrap();
        assert_eq!(request["message"], "What is PAD?");
        assert_eq!(request["research_id"], "PACO001");
        assert_eq!(request["token"], "tok");
        assert_eq!(request["model"], "gpt-4o");
        assert!(
            request["conversation_id"]
                .as_str()
                .unwrap()
                .starts_with("conv_")
        );

        h.server.push(serde_json::json!({"type": "user_message_saved"}));
        h.server.push(serde_json::json!({"type": "chunk", "content": "Periph"}));
        h.server.push(serde_json::json!({"type": "chunk", "content": "eral"}));
        h.server.push(serde_json::json!({
            "type": "complete",
            "full_response": "Peripheral Artery Disease"
        }));

        assert_eq!(h.next().await, Notice::Partial("Periph".to_string()));
        assert_eq!(h.next().await, Notice::Partial("Peripheral".to_string()));
        match h.next().await {
            Notice::Reply(message) => {
                assert_eq!(message.role, Role::Assistant);
                assert_eq!(message.content, "Peripheral Artery Disease");
            }
            other => panic!("Expected Reply, got {:?}", other),
        }

        // The turn is over, so the next message is accepted.
        h.handle.send_text("Thanks");
        assert!(matches!(h.next().await, Notice::Sent(_)));
        h.handle.shutdown();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_while_disconnected_is_kept_but_not_sent() {
        let mut h = start(empty_history(), false, false, false);
        h.until(|n| *n == Notice::Disconnected).await;

        h.handle.send_text("What is PAD?");
        match h.next().await {
            Notice::NotSent(message) => {
                assert_eq!(message.role, Role::User);
                assert_eq!(message.content, "What is PAD?");
            }
            other => panic!("Expected NotSent, got {:?}", other),
        }

        // Nothing is pending, so the user can try again right away.
        h.handle.send_text("What is PAD?");
        assert!(matches!(h.next().await, Notice::NotSent(_)));
        assert!(h.server.requests.try_recv().is_err());
        h.handle.shutdown();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_and_blank_input_is_rejected() {
        let mut h = start(empty_history(), true, false, false);
        assert_eq!(h.next().await, Notice::Connected);

        h.handle.send_text("   ");
        assert_eq!(h.next().await, Notice::Rejected(SessionError::EmptyMessage));

        h.handle.send_text("first");
        assert!(matches!(h.next().await, Notice::Sent(_)));
        h.handle.send_text("second");
        assert_eq!(h.next().await, Notice::Rejected(SessionError::TurnInFlight));

        h.server.push(serde_json::json!({"type": "error", "error": "LLM timeout"}));
        assert_eq!(
            h.next().await,
            Notice::UpstreamError("LLM timeout".to_string())
        );
        h.handle.send_text("third");
        assert!(matches!(h.next().await, Notice::Sent(_)));
        h.handle.shutdown();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_is_shown_on_start() {
        let mut api = MockApi::new();
        api.expect_get_history()
            .withf(|token, request| token == "tok" && request.limit == 50)
            .times(1)
            .returning(|_, request| {
                Ok(HistoryPage {
                    messages: vec![Message::new(
                        &request.conversation_id,
                        Role::Assistant,
                        "Hello, I am PaCo.",
                        Utc::now(),
                    )],
                    total: 1,
                    research_id: request.research_id,
                })
            });

        let mut h = start(api, true, false, false);
        match h.until(|n| matches!(n, Notice::History(_))).await {
            Notice::History(messages) => assert_eq!(messages[0].content, "Hello, I am PaCo."),
            _ => unreachable!(),
        }
        h.handle.shutdown();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_failure_still_chats() {
        let mut api = MockApi::new();
        api.expect_get_history().returning(|_, _| {
            Err(ApiError::Transport("connection refused".to_string()))
        });

        let mut h = start(api, true, false, false);
        assert_eq!(h.next().await, Notice::Connected);
        h.handle.send_text("hello");
        assert!(matches!(h.next().await, Notice::Sent(_)));
        h.handle.shutdown();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_without_recognizer_reports_capability_error() {
        let mut h = start(empty_history(), true, false, false);
        assert_eq!(h.next().await, Notice::Connected);

        h.handle.start_call();
        match h.next().await {
            Notice::CallUnavailable(reason) => assert!(reason.contains("not supported")),
            other => panic!("Expected CallUnavailable, got {:?}", other),
        }
        assert_eq!(h.starts.load(Ordering::SeqCst), 0);
        h.handle.shutdown();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_spoken_turn_plays_reply_and_resumes_listening() {
        let mut h = start(empty_history(), true, true, false);
        assert_eq!(h.next().await, Notice::Connected);

        h.handle.start_call();
        assert_eq!(h.next().await, Notice::CallStarted);
        assert_eq!(h.starts.load(Ordering::SeqCst), 1);

        h.handle
            .recognition(RecognitionEvent::Result("what causes leg pain".to_string()));
        assert!(matches!(h.next().await, Notice::Sent(_)));
        let request = h.server.requests.recv().await.unwrap();
        assert_eq!(request["message"], "what causes leg pain");

        h.server.push(serde_json::json!({
            "type": "complete",
            "full_response": "Reduced blood flow."
        }));
        h.server.push(serde_json::json!({
            "type": "audio",
            "audio_base64": "SUQz",
            "audio_url": "audio/reply.mp3"
        }));
        assert!(matches!(h.next().await, Notice::Reply(_)));

        // Capture comes back once playback has finished and the debounce elapsed.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(h.played.lock().unwrap().len(), 1);
        assert_eq!(h.played.lock().unwrap()[0].bytes, b"ID3".to_vec());
        assert_eq!(h.starts.load(Ordering::SeqCst), 2);

        h.handle.end_call();
        assert_eq!(h.next().await, Notice::CallEnded(EndReason::User));
        h.handle.shutdown();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_clock_warns_then_ends_call() {
        let mut h = start(empty_history(), true, true, false);
        assert_eq!(h.next().await, Notice::Connected);

        let started = tokio::time::Instant::now();
        h.handle.start_call();
        assert_eq!(h.next().await, Notice::CallStarted);

        assert_eq!(
            h.next().await,
            Notice::CallWarning {
                remaining: Duration::from_secs(60)
            }
        );
        let warned_after = started.elapsed();
        assert!(warned_after >= Duration::from_secs(240));
        assert!(warned_after < Duration::from_secs(241));

        assert_eq!(h.next().await, Notice::CallEnded(EndReason::Timeout));
        assert!(started.elapsed() >= Duration::from_secs(300));

        // Typed chat keeps working after the call is gone.
        h.handle.send_text("still here");
        assert!(matches!(h.next().await, Notice::Sent(_)));
        h.handle.shutdown();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_mirroring_saves_both_sides() {
        let (saved_tx, mut saved) = mpsc::unbounded_channel();
        let mut api = empty_history();
        api.expect_save_message()
            .times(2)
            .returning(move |token, request| {
                assert_eq!(token, "tok");
                assert_eq!(request.provider, Provider::OpenAi);
                saved_tx.send((request.role, request.content.clone())).unwrap();
                Ok(SaveMessageAck {
                    success: true,
                    message_id: 1,
                    timestamp: request.timestamp,
                })
            });

        let mut h = start(api, true, false, true);
        assert_eq!(h.next().await, Notice::Connected);
        h.handle.send_text("What is PAD?");
        assert!(matches!(h.next().await, Notice::Sent(_)));
        h.server.push(serde_json::json!({
            "type": "complete",
            "full_response": "Peripheral Artery Disease"
        }));
        assert!(matches!(h.next().await, Notice::Reply(_)));

        let mirrored = vec![saved.recv().await.unwrap(), saved.recv().await.unwrap()];
        assert!(mirrored.contains(&(Role::User, "What is PAD?".to_string())));
        assert!(mirrored.contains(&(Role::Assistant, "Peripheral Artery Disease".to_string())));
        h.handle.shutdown();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_connection_clears_pending_reply() {
        let mut h = start(empty_history(), true, false, false);
        assert_eq!(h.next().await, Notice::Connected);
        h.handle.send_text("What is PAD?");
        assert!(matches!(h.next().await, Notice::Sent(_)));

        // Server hangs up mid-turn.
        h.server
            .frames
            .send(Err(TransportError::Socket("reset".to_string())))
            .unwrap();
        h.until(|n| *n == Notice::Disconnected).await;

        h.handle.send_text("retry");
        assert!(matches!(h.next().await, Notice::NotSent(_)));
        h.handle.shutdown();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_mid_call_releases_devices_and_timers() {
        let mut h = start(empty_history(), false, true, false);
        h.until(|n| *n == Notice::Disconnected).await;

        h.handle.start_call();
        h.until(|n| *n == Notice::CallStarted).await;
        assert_eq!(h.starts.load(Ordering::SeqCst), 1);
        assert_eq!(h.stops.load(Ordering::SeqCst), 0);

        // A reconnect is pending and the call clock is running.
        h.handle.shutdown();
        h.task.await.unwrap();
        assert_eq!(h.stops.load(Ordering::SeqCst), 1);
        let dials = h.backend.dials.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(h.backend.dials.load(Ordering::SeqCst), dials);
        assert!(!h.handle.post(ChatEvent::ClockTick));
        while let Some(notice) = h.notices.recv().await {
            assert!(
                !matches!(notice, Notice::CallWarning { .. } | Notice::CallEnded(_)),
                "call outlived the runtime: {:?}",
                notice
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_runtime_mid_call_stops_capture() {
        let mut h = start(empty_history(), true, true, false);
        assert_eq!(h.next().await, Notice::Connected);
        h.handle.start_call();
        assert_eq!(h.next().await, Notice::CallStarted);

        h.task.abort();
        assert!(h.task.await.unwrap_err().is_cancelled());
        assert_eq!(h.stops.load(Ordering::SeqCst), 1);
        let dials = h.backend.dials.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(h.backend.dials.load(Ordering::SeqCst), dials);
        assert!(h.notices.recv().await.is_none());
    }

    /// Flags itself when dropped, so a test can see a save was cancelled.
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// A backend whose transcript saves never complete.
    struct StalledSaves {
        started: Arc<AtomicUsize>,
        cancelled: Arc<AtomicBool>,
    }

    #[async_trait]
    impl PacoApi for StalledSaves {
        async fn validate_research_id(
            &self,
            _research_id: &str,
        ) -> Result<ResearchIdValidation, ApiError> {
            unimplemented!()
        }

        async fn acknowledge_disclaimer(
            &self,
            _research_id: &str,
        ) -> Result<DisclaimerAcknowledgment, ApiError> {
            unimplemented!()
        }

        async fn login(&self, _research_id: &str) -> Result<AccessToken, ApiError> {
            unimplemented!()
        }

        async fn get_history(
            &self,
            _token: &str,
            request: HistoryRequest,
        ) -> Result<HistoryPage, ApiError> {
            Ok(HistoryPage {
                messages: vec![],
                total: 0,
                research_id: request.research_id,
            })
        }

        async fn save_message(
            &self,
            _token: &str,
            _request: SaveMessageRequest,
        ) -> Result<SaveMessageAck, ApiError> {
            let _flag = DropFlag(self.cancelled.clone());
            self.started.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_stalled_transcript_saves() {
        let started = Arc::new(AtomicUsize::new(0));
        let cancelled = Arc::new(AtomicBool::new(false));
        let api = StalledSaves {
            started: started.clone(),
            cancelled: cancelled.clone(),
        };

        let mut h = start(api, true, false, true);
        assert_eq!(h.next().await, Notice::Connected);
        h.handle.send_text("What is PAD?");
        assert!(matches!(h.next().await, Notice::Sent(_)));
        while started.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let stopping = tokio::time::Instant::now();
        h.handle.shutdown();
        h.task.await.unwrap();
        assert!(stopping.elapsed() >= MIRROR_GRACE);
        assert_eq!(started.load(Ordering::SeqCst), 1);

        // Aborted tasks are torn down the next time the scheduler runs them.
        for _ in 0..10 {
            if cancelled.load(Ordering::SeqCst) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(cancelled.load(Ordering::SeqCst));
    }
}
