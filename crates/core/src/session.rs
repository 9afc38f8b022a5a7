//! Conversation Session State
//!
//! Owns the ordered message log for one (research ID, conversation ID) pair,
//! the transient buffer for the assistant reply being streamed, and the single
//! "assistant is responding" indicator.

use crate::{
    Credentials, Outbound,
    api::{HistoryRequest, PacoApi},
    message::{Message, Role},
    protocol::ChatRequest,
};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("message is empty")]
    EmptyMessage,
    #[error("the assistant is still responding to the previous message")]
    TurnInFlight,
}

/// The result of a user turn that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedTurn {
    /// The user message, already appended to the log.
    pub message: Message,
    /// Whether the request reached the transport. `false` means it was lost.
    pub delivered: bool,
}

/// Builds the per-session conversation identifier: `conv_<UTC timestamp>_<research id>`.
pub fn generate_conversation_id(research_id: &str, now: DateTime<Utc>) -> String {
    format!("conv_{}_{}", now.format("%Y%m%d%H%M%S"), research_id)
}

#[derive(Debug)]
pub struct ConversationSession {
    research_id: String,
    conversation_id: String,
    messages: Vec<Message>,
    pending_reply: String,
    responding: bool,
    history_loaded: bool,
}

impl ConversationSession {
    /// Opens a new session, generating its conversation ID from `now`.
    pub fn new(research_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            research_id: research_id.to_string(),
            conversation_id: generate_conversation_id(research_id, now),
            messages: Vec::new(),
            pending_reply: String::new(),
            responding: false,
            history_loaded: false,
        }
    }

    pub fn research_id(&self) -> &str {
        &self.research_id
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Committed messages in display order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Text streamed so far for the reply in progress.
    pub fn pending_reply(&self) -> &str {
        &self.pending_reply
    }

    pub fn is_responding(&self) -> bool {
        self.responding
    }

    /// Whether the input layer should accept a new submission.
    pub fn can_submit(&self) -> bool {
        !self.responding
    }

    /// Validates and appends a user turn, then hands it to `outbound`.
    ///
    /// The user message is committed optimistically, before the backend
    /// acknowledges it. If the transport refuses the request the message stays
    /// in the log and only the responding indicator is cleared.
    pub fn append_user_message(
        &mut self,
        text: &str,
        credentials: &Credentials,
        model: &str,
        outbound: &dyn Outbound,
        now: DateTime<Utc>,
    ) -> Result<SubmittedTurn, SessionError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        if self.responding {
            return Err(SessionError::TurnInFlight);
        }

        let message = Message::new(&self.conversation_id, Role::User, text, now);
        self.messages.push(message.clone());
        self.pending_reply.clear();
        self.responding = true;

        let request = ChatRequest {
            token: credentials.token.clone(),
            research_id: credentials.research_id.clone(),
            conversation_id: self.conversation_id.clone(),
            message: text.to_string(),
            model: model.to_string(),
        };
        let delivered = outbound.send(&request);
        if !delivered {
            warn!(conversation_id = %self.conversation_id, "Message not sent: connection is not open.");
            self.responding = false;
        }

        Ok(SubmittedTurn { message, delivered })
    }

    /// Appends streamed text to the reply in progress.
    pub fn push_partial(&mut self, content: &str) {
        self.pending_reply.push_str(content);
        self.responding = true;
    }

    /// Commits the authoritative reply text as a new assistant message.
    ///
    /// `full_response` wins over whatever was streamed into the buffer.
    pub fn commit_reply(&mut self, full_response: &str, now: DateTime<Utc>) -> &Message {
        if full_response != self.pending_reply {
            debug!(
                streamed_len = self.pending_reply.len(),
                final_len = full_response.len(),
                "Final reply differs from streamed text."
            );
        }
        self.messages.push(Message::new(
            &self.conversation_id,
            Role::Assistant,
            full_response,
            now,
        ));
        self.pending_reply.clear();
        self.responding = false;
        &self.messages[self.messages.len() - 1]
    }

    /// Drops the reply in progress after an upstream failure.
    pub fn abandon_reply(&mut self) {
        self.pending_reply.clear();
        self.responding = false;
    }

    /// Replaces the log with stored history. Only the first call does anything.
    ///
    /// A failed fetch is logged and leaves the session usable with an empty log.
    /// Returns the number of messages loaded.
    pub async fn load_history(&mut self, api: &dyn PacoApi, token: &str, limit: u32) -> usize {
        if self.history_loaded {
            return 0;
        }
        self.history_loaded = true;

        let request = HistoryRequest {
            research_id: self.research_id.clone(),
            conversation_id: self.conversation_id.clone(),
            limit,
            offset: 0,
        };
        match api.get_history(token, request).await {
            Ok(page) => {
                info!(
                    loaded = page.messages.len(),
                    total = page.total,
                    "Conversation history loaded."
                );
                self.messages = page.messages;
                self.messages.len()
            }
            Err(e) => {
                warn!(error = %e, "Could not load conversation history; continuing without it.");
                0
            }
        }
    }
}
