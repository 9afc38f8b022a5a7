//! Message Stream Assembler
//!
//! Turns raw inbound payloads into session updates. Streamed `chunk` text is
//! accumulated in the session's reply buffer, `complete` commits the
//! authoritative text, and `audio` is decoded and handed back to the caller for
//! the voice coordinator. Nothing here ever fails the channel: payloads that
//! cannot be used are logged and dropped.

use crate::{
    message::Message,
    protocol::Frame,
    session::ConversationSession,
    voice::AudioClip,
};
use base64::Engine;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

/// What a single inbound payload did to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// The payload was dropped or carried nothing to act on.
    Ignored,
    /// Streamed text was appended; the reply so far is attached.
    Partial(String),
    /// A complete assistant reply was committed to the log.
    Committed(Message),
    /// Speech to be played by the voice coordinator.
    Play(AudioClip),
    /// The backend persisted the last user message.
    Acknowledged,
    /// The backend gave up on the current turn.
    UpstreamError(String),
}

#[derive(Debug, Default)]
pub struct StreamAssembler {
    dropped: u64,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of payloads dropped as unusable since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Parses one raw payload and applies it to `session`.
    pub fn dispatch(
        &mut self,
        raw: &str,
        session: &mut ConversationSession,
        now: DateTime<Utc>,
    ) -> Dispatch {
        let frame = match Frame::parse(raw) {
            Ok(frame) => frame,
            Err(e) => {
                self.dropped += 1;
                warn!(error = %e, "Dropping unreadable frame.");
                return Dispatch::Ignored;
            }
        };
        debug!(kind = frame.kind(), "Frame received.");

        match frame {
            Frame::Chunk { content } => match content {
                Some(content) if !content.is_empty() => {
                    session.push_partial(&content);
                    Dispatch::Partial(session.pending_reply().to_string())
                }
                _ => Dispatch::Ignored,
            },
            Frame::Complete { full_response, .. } => match full_response {
                Some(text) if !text.is_empty() => {
                    Dispatch::Committed(session.commit_reply(&text, now).clone())
                }
                _ => {
                    self.dropped += 1;
                    warn!("Dropping `complete` frame without a response body.");
                    Dispatch::Ignored
                }
            },
            Frame::Audio {
                audio_base64,
                audio_url,
            } => {
                let Some(encoded) = audio_base64.filter(|a| !a.is_empty()) else {
                    self.dropped += 1;
                    warn!("Audio frame carried no audio data.");
                    return Dispatch::Ignored;
                };
                match base64::engine::general_purpose::STANDARD.decode(encoded.as_bytes()) {
                    Ok(bytes) => Dispatch::Play(AudioClip {
                        bytes,
                        source_url: audio_url,
                    }),
                    Err(e) => {
                        self.dropped += 1;
                        warn!(error = %e, "Audio frame payload is not valid base64.");
                        Dispatch::Ignored
                    }
                }
            }
            Frame::UserMessageSaved { .. } => Dispatch::Acknowledged,
            Frame::Error { error } => {
                session.abandon_reply();
                let message = error.unwrap_or_else(|| "unknown error".to_string());
                warn!(error = %message, "Backend reported an error for this turn.");
                Dispatch::UpstreamError(message)
            }
        }
    }
}
