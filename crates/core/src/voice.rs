//! Voice Capture/Playback Coordinator
//!
//! A single state machine that owns the microphone (through a
//! `SpeechRecognizer`) and the speaker (through an `AudioOutput`) for the
//! lifetime of a chat session. Capture and playback are never active at the
//! same time: capture is stopped before any clip is played and only restarted
//! once playback has ended.
//!
//! Transitions are plain methods. Work that has to happen later (restarting
//! recognition after a debounce, running the call clock) is returned as
//! `VoiceEffect`s for the runtime to schedule, which keeps this module free of
//! timers and trivially testable.

use std::time::Duration;
use tracing::{debug, info, warn};

/// A decoded speech clip as received from the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    pub bytes: Vec<u8>,
    pub source_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Off,
    Listening,
    Speaking,
}

/// Why a call could not start. Shown to the user immediately.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("speech recognition is not supported on this device")]
    RecognitionUnsupported,
    #[error("microphone access was denied")]
    MicrophoneDenied,
    #[error("speech recognition is unavailable: {0}")]
    Unavailable(String),
}

/// Failure returned synchronously by `SpeechRecognizer::start`.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RecognizerError {
    #[error("recognition is already started")]
    AlreadyStarted,
    #[error("microphone access was denied")]
    PermissionDenied,
    #[error("{0}")]
    Failed(String),
}

/// Error classes reported asynchronously by a running recognition session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionErrorKind {
    NoSpeech,
    Aborted,
    AudioCapture,
    NotAllowed,
    Network,
    Other(String),
}

impl RecognitionErrorKind {
    /// Transient errors leave the call running; recognition restarts on its own.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NoSpeech | Self::Aborted)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error("audio output unavailable: {0}")]
    Unavailable(String),
}

/// One-shot speech recognition, in the style of a browser recognizer: each
/// `start` delivers at most one result and then ends by itself.
#[cfg_attr(test, mockall::automock)]
pub trait SpeechRecognizer: Send {
    fn is_supported(&self) -> bool;
    fn start(&mut self) -> Result<(), RecognizerError>;
    fn stop(&mut self);
}

/// The single audio output device.
#[cfg_attr(test, mockall::automock)]
pub trait AudioOutput: Send {
    /// Begins playing `clip`. Completion is reported later through
    /// `VoiceCoordinator::on_playback_ended`.
    fn play(&mut self, clip: AudioClip) -> Result<(), PlaybackError>;
    fn stop(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallLimits {
    /// Elapsed call time at which the user is warned.
    pub warning_after: Duration,
    /// Elapsed call time at which the call is forced off.
    pub hard_limit: Duration,
    /// Debounce between playback end and restarting capture.
    pub resume_after_playback: Duration,
    /// Delay before restarting capture after a recognition session ends.
    pub restart_after_silence: Duration,
}

impl Default for CallLimits {
    fn default() -> Self {
        Self {
            warning_after: Duration::from_secs(240),
            hard_limit: Duration::from_secs(300),
            resume_after_playback: Duration::from_millis(300),
            restart_after_silence: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    User,
    Timeout,
    RecognitionFailed,
    Shutdown,
}

/// Work the runtime must carry out on behalf of the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceEffect {
    /// Start ticking the call clock.
    StartClock,
    /// Stop ticking the call clock.
    StopClock,
    /// Call `on_restart_due(epoch)` after `delay`.
    ScheduleRestart { delay: Duration, epoch: u64 },
    /// Submit recognized speech as a user message.
    Submit(String),
    /// The call is about to hit its time limit.
    Warning { remaining: Duration },
    /// The call ended.
    Ended(EndReason),
}

pub struct VoiceCoordinator {
    recognizer: Box<dyn SpeechRecognizer>,
    output: Box<dyn AudioOutput>,
    limits: CallLimits,
    state: CallState,
    capture_active: bool,
    playing: bool,
    elapsed: Duration,
    warned: bool,
    epoch: u64,
}

impl VoiceCoordinator {
    pub fn new(
        recognizer: Box<dyn SpeechRecognizer>,
        output: Box<dyn AudioOutput>,
        limits: CallLimits,
    ) -> Self {
        Self {
            recognizer,
            output,
            limits,
            state: CallState::Off,
            capture_active: false,
            playing: false,
            elapsed: Duration::ZERO,
            warned: false,
            epoch: 0,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn in_call(&self) -> bool {
        self.state != CallState::Off
    }

    pub fn is_capturing(&self) -> bool {
        self.capture_active
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn warning_shown(&self) -> bool {
        self.warned
    }

    /// `off → listening`. Fails fast if the device cannot recognize speech.
    pub fn start_call(&mut self) -> Result<Vec<VoiceEffect>, CapabilityError> {
        if self.in_call() {
            return Ok(vec![]);
        }
        if !self.recognizer.is_supported() {
            return Err(CapabilityError::RecognitionUnsupported);
        }

        if self.playing {
            // Capture resumes when the current clip finishes.
            self.state = CallState::Speaking;
        } else {
            match self.recognizer.start() {
                Ok(()) | Err(RecognizerError::AlreadyStarted) => {}
                Err(RecognizerError::PermissionDenied) => {
                    return Err(CapabilityError::MicrophoneDenied);
                }
                Err(RecognizerError::Failed(reason)) => {
                    return Err(CapabilityError::Unavailable(reason));
                }
            }
            self.capture_active = true;
            self.state = CallState::Listening;
        }

        self.elapsed = Duration::ZERO;
        self.warned = false;
        self.epoch += 1;
        info!(state = ?self.state, "Call started.");
        Ok(vec![VoiceEffect::StartClock])
    }

    /// `* → off`. Safe to call from any state; does nothing when already off.
    pub fn end_call(&mut self, reason: EndReason) -> Vec<VoiceEffect> {
        if !self.in_call() {
            return vec![];
        }
        self.epoch += 1;
        self.stop_capture();
        self.state = CallState::Off;
        self.elapsed = Duration::ZERO;
        self.warned = false;
        info!(?reason, "Call ended.");
        vec![VoiceEffect::StopClock, VoiceEffect::Ended(reason)]
    }

    /// Ends any call and silences the speaker. Used on teardown.
    pub fn shutdown(&mut self) -> Vec<VoiceEffect> {
        let effects = self.end_call(EndReason::Shutdown);
        if self.playing {
            self.output.stop();
            self.playing = false;
        }
        effects
    }

    /// `listening → speaking`. Capture is stopped before playback begins.
    pub fn on_audio(&mut self, clip: AudioClip) -> Vec<VoiceEffect> {
        // Invalidate any restart scheduled before this clip arrived.
        self.epoch += 1;
        self.stop_capture();
        self.playing = true;
        if self.state == CallState::Listening {
            self.state = CallState::Speaking;
        }

        debug!(bytes = clip.bytes.len(), "Playing assistant audio.");
        match self.output.play(clip) {
            Ok(()) => vec![],
            Err(e) => {
                warn!(error = %e, "Audio playback failed.");
                self.on_playback_ended()
            }
        }
    }

    /// `speaking → listening`, with capture restarted after a short debounce.
    pub fn on_playback_ended(&mut self) -> Vec<VoiceEffect> {
        if !self.playing {
            return vec![];
        }
        self.playing = false;
        if self.state != CallState::Speaking {
            return vec![];
        }
        self.state = CallState::Listening;
        vec![self.schedule_restart(self.limits.resume_after_playback)]
    }

    /// A scheduled restart fired. Stale or no-longer-applicable restarts are ignored.
    pub fn on_restart_due(&mut self, epoch: u64) -> Vec<VoiceEffect> {
        if epoch != self.epoch
            || self.state != CallState::Listening
            || self.playing
            || self.capture_active
        {
            return vec![];
        }
        match self.recognizer.start() {
            Ok(()) | Err(RecognizerError::AlreadyStarted) => {
                self.capture_active = true;
                vec![]
            }
            Err(e) => {
                warn!(error = %e, "Could not restart speech recognition.");
                self.end_call(EndReason::RecognitionFailed)
            }
        }
    }

    /// A recognition session produced a transcript.
    pub fn on_recognition_result(&mut self, transcript: &str) -> Vec<VoiceEffect> {
        if !self.in_call() {
            return vec![];
        }
        let transcript = transcript.trim();
        if transcript.is_empty() {
            return vec![];
        }
        vec![VoiceEffect::Submit(transcript.to_string())]
    }

    /// A recognition session ended on its own.
    pub fn on_recognition_end(&mut self) -> Vec<VoiceEffect> {
        self.capture_active = false;
        if self.state == CallState::Listening && !self.playing {
            vec![self.schedule_restart(self.limits.restart_after_silence)]
        } else {
            vec![]
        }
    }

    /// A running recognition session failed.
    pub fn on_recognition_error(&mut self, kind: RecognitionErrorKind) -> Vec<VoiceEffect> {
        if kind.is_transient() {
            debug!(?kind, "Transient recognition error; continuing.");
            return vec![];
        }
        warn!(?kind, "Speech recognition failed.");
        self.end_call(EndReason::RecognitionFailed)
    }

    /// Advances the call clock by `by`, warning and then hanging up at the limits.
    pub fn advance_clock(&mut self, by: Duration) -> Vec<VoiceEffect> {
        if !self.in_call() {
            return vec![];
        }
        self.elapsed += by;
        if self.elapsed >= self.limits.hard_limit {
            return self.end_call(EndReason::Timeout);
        }
        if !self.warned && self.elapsed >= self.limits.warning_after {
            self.warned = true;
            return vec![VoiceEffect::Warning {
                remaining: self.limits.hard_limit - self.elapsed,
            }];
        }
        vec![]
    }

    fn stop_capture(&mut self) {
        if self.capture_active {
            self.recognizer.stop();
            self.capture_active = false;
        }
    }

    fn schedule_restart(&mut self, delay: Duration) -> VoiceEffect {
        self.epoch += 1;
        VoiceEffect::ScheduleRestart {
            delay,
            epoch: self.epoch,
        }
    }
}

impl Drop for VoiceCoordinator {
    fn drop(&mut self) {
        self.stop_capture();
        if self.playing {
            self.output.stop();
        }
    }
}
