//! Grounded answer generation, buffered and streaming.
//!
//! Both variants run the same context assembly while holding the session's
//! [`SessionTurn`](crate::session::SessionTurn):
//!
//! 1. append the question as a user message
//! 2. retrieve the top-k chunks and join their text as the context
//! 3. render the prior conversation as labeled turns
//! 4. combine them with [`INSTRUCTION`] into one prompt
//!
//! The assistant message is committed only once the complete answer is
//! known. Any failure, or a streaming consumer that goes away, rolls back the
//! user message so the history never ends on an unanswered question.
//!
//! # Streaming protocol
//!
//! [`AnswerPipeline::stream`] yields exactly one [`StreamEvent::Sources`],
//! then zero or more [`StreamEvent::Token`]s in generation order, then one
//! [`StreamEvent::End`]. A generation failure after streaming began is
//! delivered as a final `Err` item and no `End` follows.

use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::error::{KbError, Result};
use crate::generation::Generator;
use crate::models::{Answer, Message, Role, ScoredChunk, SourceRef, StreamEvent};
use crate::retriever::Retriever;
use crate::session::SessionStore;

/// Instruction placed ahead of every prompt.
pub const INSTRUCTION: &str = "\
Answer the user's question using the context and the conversation history below.
If you are not sure of the answer, give the most reasonable answer supported by the context. \
Never make up information that is not in the context.";

/// Events buffered between the producer and a slow consumer.
const STREAM_BUFFER: usize = 32;

/// Items of a streamed answer.
pub type EventStream = ReceiverStream<Result<StreamEvent>>;

pub struct AnswerPipeline {
    retriever: Retriever,
    generator: Arc<dyn Generator>,
    sessions: Arc<SessionStore>,
}

impl AnswerPipeline {
    pub fn new(
        retriever: Retriever,
        generator: Arc<dyn Generator>,
        sessions: Arc<SessionStore>,
    ) -> Self {
        Self {
            retriever,
            generator,
            sessions,
        }
    }

    /// Answer `question` in one piece and record the exchange in `session_id`.
    pub async fn answer(&self, question: &str, session_id: &str) -> Result<Answer> {
        let question = validate_question(question)?;
        let mut turn = self.sessions.begin_turn(session_id).await;
        turn.push_user(Message::user(question));

        // Early returns drop `turn`, which rolls the question back.
        let hits = self.retriever.retrieve(question).await?;
        let prompt = build_prompt(&hits, &turn.prior_messages(), question);
        let sources = sources_of(&hits);

        let answer = self
            .generator
            .generate(&prompt)
            .await
            .map_err(|e| KbError::Generation(e.to_string()))?;

        turn.commit(Message::assistant(answer.clone(), sources.clone()));
        info!(session = session_id, sources = sources.len(), "answered question");
        Ok(Answer { answer, sources })
    }

    /// Answer `question` incrementally.
    ///
    /// Failures before streaming starts (retrieval, the generation request
    /// itself) are returned directly.
    pub async fn stream(&self, question: &str, session_id: &str) -> Result<EventStream> {
        let question = validate_question(question)?;
        let mut turn = self.sessions.begin_turn(session_id).await;
        turn.push_user(Message::user(question));

        let hits = self.retriever.retrieve(question).await?;
        let prompt = build_prompt(&hits, &turn.prior_messages(), question);
        let sources = sources_of(&hits);

        let mut tokens = self
            .generator
            .generate_stream(&prompt)
            .await
            .map_err(|e| KbError::Generation(e.to_string()))?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let session = session_id.to_string();

        tokio::spawn(async move {
            if tx
                .send(Ok(StreamEvent::Sources {
                    sources: sources.clone(),
                }))
                .await
                .is_err()
            {
                debug!(session = %session, "consumer gone before sources");
                return;
            }

            let mut answer = String::new();
            loop {
                let next = tokio::select! {
                    _ = tx.closed() => {
                        debug!(session = %session, "consumer disconnected, abandoning answer");
                        return;
                    }
                    item = tokens.next() => item,
                };

                match next {
                    Some(Ok(token)) => {
                        answer.push_str(&token);
                        if tx.send(Ok(StreamEvent::Token { token })).await.is_err() {
                            debug!(session = %session, "consumer disconnected, abandoning answer");
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(session = %session, error = %e, "generation failed mid-stream");
                        turn.rollback();
                        drop(turn);
                        let _ = tx.send(Err(KbError::Generation(e.to_string()))).await;
                        return;
                    }
                    None => break,
                }
            }

            turn.commit(Message::assistant(answer, sources));
            let _ = tx.send(Ok(StreamEvent::End)).await;
            info!(session = %session, "streamed answer");
        });

        Ok(ReceiverStream::new(rx))
    }
}

fn validate_question(question: &str) -> Result<&str> {
    let question = question.trim();
    if question.is_empty() {
        return Err(KbError::InvalidInput("question must not be empty".to_string()));
    }
    Ok(question)
}

fn sources_of(hits: &[ScoredChunk]) -> Vec<SourceRef> {
    hits.iter().map(|h| SourceRef::from(&h.chunk)).collect()
}

/// Combine the instruction, retrieved context, prior turns and the question.
pub fn build_prompt(hits: &[ScoredChunk], history: &[Message], question: &str) -> String {
    let context = hits
        .iter()
        .map(|h| h.chunk.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "{}\n\nContext:\n{}\n\nConversation history:\n{}\n\nQuestion: {}\n\nAnswer:",
        INSTRUCTION,
        context,
        render_history(history),
        question
    )
}

/// Render complete user/assistant pairs, oldest first.
///
/// Messages without a partner (a leading answer whose question fell out of
/// the window) are skipped.
pub fn render_history(history: &[Message]) -> String {
    let mut lines = Vec::new();
    let mut i = 0;
    while i < history.len() {
        match (history.get(i), history.get(i + 1)) {
            (Some(q), Some(a)) if q.role == Role::User && a.role == Role::Assistant => {
                lines.push(format!("User: {}", q.content));
                lines.push(format!("Assistant: {}", a.content));
                i += 2;
            }
            _ => i += 1,
        }
    }
    lines.join("\n")
}
