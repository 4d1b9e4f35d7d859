//! Session orchestrator: wires capture, playback, screen recording and the
//! protocol client together behind one command-driven task.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::audio::{
    AlsaInputOpener, AlsaOutputOpener, AudioCapture, AudioInputOpener, AudioOutputOpener,
    AudioPlayback,
};
use crate::client::{ClientEvent, ProtocolClient};
use crate::config::{PLAYBACK_SAMPLE_RATE, SessionConfig};
use crate::error::SessionError;
use crate::events::{EventBus, EventKind, SessionEvent, SubscriptionId};
use crate::protocol::SetupMessage;
use crate::screen::{
    DisplayOpener, DisplaySource, DisplayStream, ScreenCapture, SharedDisplaySource,
};
use crate::transcript::{
    ContextPatch, ConversationSession, InterviewContext, Role, ScreenFrameRecord,
};

/// Device backends the orchestrator draws on. Hosts swap these out for
/// platforms this crate has no native backend for.
#[derive(Clone)]
pub struct SessionBackends {
    pub audio_input: Arc<dyn AudioInputOpener>,
    pub audio_output: Arc<dyn AudioOutputOpener>,
    pub display: Arc<dyn DisplayOpener>,
}

impl SessionBackends {
    /// ALSA audio on the configured devices. There is no native display
    /// backend; hosts lend a display stream when starting screen capture.
    pub fn alsa(config: &SessionConfig) -> Self {
        Self {
            audio_input: Arc::new(AlsaInputOpener::new(config.capture_device.clone())),
            audio_output: Arc::new(AlsaOutputOpener::new(config.playback_device.clone())),
            display: Arc::new(NoDisplay),
        }
    }
}

struct NoDisplay;

impl DisplayOpener for NoDisplay {
    fn open(&self) -> Result<Box<dyn DisplaySource>, SessionError> {
        Err(SessionError::NotSupported(
            "no display backend configured; lend a display stream instead".into(),
        ))
    }
}

enum SessionCommand {
    Start {
        context: InterviewContext,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    StartListening {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    StopListening,
    StartScreen {
        interval: Duration,
        external: Option<SharedDisplaySource>,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    StopScreen,
    SendText {
        text: String,
    },
    UpdateContext(ContextPatch),
    End {
        reply: oneshot::Sender<Option<ConversationSession>>,
    },
}

/// Events the orchestrator sends itself from spawned work.
enum InternalEvent {
    PlaybackDrained,
    ScreenFrame(ScreenFrameRecord),
    ScreenEnded,
}

/// Public handle to the session task. Cheap to use from any async context;
/// all real work happens on the task.
pub struct SessionOrchestrator {
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    events: EventBus,
}

impl SessionOrchestrator {
    pub fn new(config: SessionConfig, backends: SessionBackends) -> Self {
        let events = EventBus::new();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (client_event_tx, client_event_rx) = mpsc::channel(256);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let actor = SessionActor {
            config,
            backends,
            events: events.clone(),
            client_event_tx,
            internal_tx,
            client: None,
            playback: None,
            capture: None,
            screen: ScreenCapture::new(),
            session: None,
            context: None,
            connected: false,
            listening: false,
            ai_speaking: false,
        };
        tokio::spawn(actor.run(cmd_rx, client_event_rx, internal_rx));

        Self { cmd_tx, events }
    }

    /// Register for one kind of session event.
    pub fn subscribe(
        &self,
        kind: EventKind,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<SessionEvent>) {
        self.events.subscribe(kind)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.events.unsubscribe(id)
    }

    /// Validate the credential, connect to the remote service and open the
    /// playback path. Fails without side effects when a session is already
    /// active or the credential is unusable.
    pub async fn start(&self, context: InterviewContext) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Start { context, reply })
            .await?
    }

    /// Acquire the microphone and stream captured frames upstream.
    pub async fn start_listening(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::StartListening { reply })
            .await?
    }

    pub fn stop_listening(&self) {
        let _ = self.cmd_tx.send(SessionCommand::StopListening);
    }

    /// Start periodic screen capture, either on a stream lent by the caller
    /// or one opened from the display backend.
    pub async fn start_screen_capture(
        &self,
        interval: Duration,
        external: Option<SharedDisplaySource>,
    ) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::StartScreen {
            interval,
            external,
            reply,
        })
        .await?
    }

    pub fn stop_screen_capture(&self) {
        let _ = self.cmd_tx.send(SessionCommand::StopScreen);
    }

    /// Send a complete typed user turn.
    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.cmd_tx.send(SessionCommand::SendText { text: text.into() });
    }

    /// Patch the interview context held by the running session.
    pub fn update_context(&self, patch: ContextPatch) {
        let _ = self.cmd_tx.send(SessionCommand::UpdateContext(patch));
    }

    /// Tear the session down and return its finalized record. Never fails;
    /// returns `None` when no session was active.
    pub async fn end(&self) -> Option<ConversationSession> {
        self.request(|reply| SessionCommand::End { reply })
            .await
            .ok()
            .flatten()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply_tx))
            .map_err(|_| SessionError::Config("session task not running".into()))?;
        reply_rx
            .await
            .map_err(|_| SessionError::Config("session task not running".into()))
    }
}

struct SessionActor {
    config: SessionConfig,
    backends: SessionBackends,
    events: EventBus,
    client_event_tx: mpsc::Sender<ClientEvent>,
    internal_tx: mpsc::UnboundedSender<InternalEvent>,
    client: Option<Arc<ProtocolClient>>,
    playback: Option<AudioPlayback>,
    capture: Option<AudioCapture>,
    screen: ScreenCapture,
    session: Option<ConversationSession>,
    context: Option<InterviewContext>,
    connected: bool,
    listening: bool,
    ai_speaking: bool,
}

impl SessionActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
        mut client_rx: mpsc::Receiver<ClientEvent>,
        mut internal_rx: mpsc::UnboundedReceiver<InternalEvent>,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    None => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                Some(event) = client_rx.recv() => self.handle_client_event(event),
                Some(event) = internal_rx.recv() => self.handle_internal(event),
            }
        }
        // Handle dropped: release devices and close the connection.
        self.end_session();
    }

    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Start { context, reply } => {
                let _ = reply.send(self.start_session(context).await);
            }
            SessionCommand::StartListening { reply } => {
                let _ = reply.send(self.start_listening());
            }
            SessionCommand::StopListening => self.stop_listening(),
            SessionCommand::StartScreen {
                interval,
                external,
                reply,
            } => {
                let _ = reply.send(self.start_screen(interval, external));
            }
            SessionCommand::StopScreen => self.screen.stop(),
            SessionCommand::SendText { text } => self.send_text(&text),
            SessionCommand::UpdateContext(patch) => match &mut self.context {
                Some(context) => context.apply(patch),
                None => warn!("Ignoring context update, no active session"),
            },
            SessionCommand::End { reply } => {
                let _ = reply.send(self.end_session());
            }
        }
    }

    async fn start_session(&mut self, context: InterviewContext) -> Result<(), SessionError> {
        if self.session.is_some() {
            return Err(SessionError::Config("a session is already active".into()));
        }
        // Fail fast on bad credentials, before touching devices or network.
        self.config.validate_credential()?;

        let sink = self.backends.audio_output.open()?;
        let prompt = build_system_prompt(&self.config.system_instruction, &context);
        let setup = SetupMessage::from_config(&self.config, prompt);
        let client = Arc::new(ProtocolClient::new(
            self.config.clone(),
            self.client_event_tx.clone(),
        ));
        client.connect(&setup).await?;

        info!("Session started: interview={}", context.id);
        self.playback = Some(AudioPlayback::new(sink, PLAYBACK_SAMPLE_RATE));
        self.client = Some(client);
        self.session = Some(ConversationSession::new(self.config.model.clone()));
        self.context = Some(context);
        Ok(())
    }

    fn start_listening(&mut self) -> Result<(), SessionError> {
        if self.listening {
            return Ok(());
        }
        let Some(client) = self.client.clone() else {
            return Err(SessionError::Config("no active session".into()));
        };

        let mut capture = AudioCapture::new(self.backends.audio_input.clone());
        capture.start(Arc::new(move |frame: Bytes| client.send_audio(&frame)))?;
        self.capture = Some(capture);
        self.listening = true;
        self.events.emit(SessionEvent::ListeningStart);
        Ok(())
    }

    fn stop_listening(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        if self.listening {
            self.listening = false;
            self.events.emit(SessionEvent::ListeningStop);
        }
    }

    fn start_screen(
        &mut self,
        interval: Duration,
        external: Option<SharedDisplaySource>,
    ) -> Result<(), SessionError> {
        if !self.config.screen_capture_enabled {
            return Err(SessionError::NotSupported(
                "screen capture is disabled for this session".into(),
            ));
        }
        if self.screen.is_active() {
            return Ok(());
        }
        let Some(client) = self.client.clone() else {
            return Err(SessionError::Config("no active session".into()));
        };

        let stream = match external {
            Some(shared) => DisplayStream::Borrowed(shared),
            None => DisplayStream::Owned(self.backends.display.open()?),
        };

        let frame_tx = self.internal_tx.clone();
        let on_capture = move |record: ScreenFrameRecord| {
            client.send_video(record.mime_type, &record.data);
            let _ = frame_tx.send(InternalEvent::ScreenFrame(record));
        };
        let ended_tx = self.internal_tx.clone();
        self.screen.start(stream, interval, on_capture, move || {
            let _ = ended_tx.send(InternalEvent::ScreenEnded);
        });
        Ok(())
    }

    fn send_text(&mut self, text: &str) {
        let Some(client) = &self.client else {
            warn!("Dropping text send, no active session");
            return;
        };
        client.send_text(text);
        // A typed turn is part of the conversation like a spoken one.
        if let Some(session) = &mut self.session {
            session.append_fragment(Role::User, text);
        }
    }

    fn end_session(&mut self) -> Option<ConversationSession> {
        self.stop_listening();
        self.screen.stop();
        if let Some(playback) = self.playback.take() {
            playback.stop();
        }
        if let Some(client) = self.client.take() {
            client.disconnect();
        }
        self.connected = false;
        self.ai_speaking = false;
        self.context = None;
        self.session.take().map(|mut session| {
            session.finalize();
            info!(
                "Session ended: duration={:.1}s turns={}",
                session.duration_secs,
                session.turns.len()
            );
            session
        })
    }

    fn handle_client_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Connected => {
                self.connected = true;
                self.events.emit(SessionEvent::Connected);
            }
            ClientEvent::Disconnected { code, reason } => {
                self.connected = false;
                // No more audio is coming; a latched speaking flag would
                // never clear otherwise.
                self.mark_ai_quiet();
                self.events.emit(SessionEvent::Disconnected { code, reason });
            }
            ClientEvent::Audio(pcm) => {
                if let Some(playback) = &self.playback {
                    // New audio cancels any pending end-of-turn drain.
                    playback.reset_finishing();
                    playback.enqueue(pcm.clone());
                }
                if !self.ai_speaking {
                    self.ai_speaking = true;
                    self.events.emit(SessionEvent::AiSpeakingStart);
                }
                self.events.emit(SessionEvent::AudioReceived { pcm });
            }
            ClientEvent::Text(text) => self.events.emit(SessionEvent::TextReceived { text }),
            ClientEvent::UserTranscript(text) => {
                if let Some(session) = &mut self.session {
                    session.append_fragment(Role::User, &text);
                }
                self.events.emit(SessionEvent::UserTranscript { text });
            }
            ClientEvent::AiTranscript(text) => {
                if let Some(session) = &mut self.session {
                    session.append_fragment(Role::Assistant, &text);
                }
                self.events.emit(SessionEvent::AiTranscript { text });
            }
            ClientEvent::TurnComplete => {
                self.events.emit(SessionEvent::TurnComplete);
                match &self.playback {
                    Some(playback) => {
                        // Speaking ends when the buffered audio has played
                        // out, not when the last frame arrives.
                        let tx = self.internal_tx.clone();
                        playback.finish(move || {
                            let _ = tx.send(InternalEvent::PlaybackDrained);
                        });
                    }
                    None => self.mark_ai_quiet(),
                }
            }
            ClientEvent::Interrupted => {
                if let Some(playback) = &self.playback {
                    playback.stop();
                }
                if let Some(session) = &mut self.session {
                    session.record_interruption();
                }
                self.mark_ai_quiet();
                self.events.emit(SessionEvent::Interrupted);
            }
            ClientEvent::Error(message) => self.events.emit(SessionEvent::Error { message }),
        }
    }

    fn handle_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::PlaybackDrained => self.mark_ai_quiet(),
            InternalEvent::ScreenFrame(record) => {
                if let Some(session) = &mut self.session {
                    session.record_screen_capture(record.clone());
                }
                self.events.emit(SessionEvent::ScreenCapture(record));
            }
            InternalEvent::ScreenEnded => {
                info!("Screen share ended by its source");
                self.events.emit(SessionEvent::ScreenCaptureEnded);
            }
        }
    }

    fn mark_ai_quiet(&mut self) {
        if self.ai_speaking {
            self.ai_speaking = false;
            self.events.emit(SessionEvent::AiSpeakingStop);
        }
    }
}

/// Compose the system prompt sent at setup from the base instruction and the
/// interview context.
fn build_system_prompt(base: &str, context: &InterviewContext) -> String {
    let mut prompt = String::from(base);
    prompt.push_str("\n\nYou are interviewing a candidate for the role of ");
    prompt.push_str(&context.job_title);
    prompt.push('.');
    if let Some(company) = &context.company {
        prompt.push_str(" The position is at ");
        prompt.push_str(company);
        prompt.push('.');
    }
    prompt.push_str("\nDifficulty level: ");
    prompt.push_str(&context.difficulty);
    prompt.push('.');
    if !context.focus_areas.is_empty() {
        prompt.push_str("\nFocus areas: ");
        prompt.push_str(&context.focus_areas.join(", "));
        prompt.push('.');
    }
    if !context.questions.is_empty() {
        prompt.push_str("\nPlanned questions:\n");
        for (i, question) in context.questions.iter().enumerate() {
            prompt.push_str(&format!("{}. {}\n", i + 1, question.text));
        }
        let start = context.current_question.min(context.questions.len() - 1);
        prompt.push_str(&format!("Start from question {}.", start + 1));
    }
    prompt
}
