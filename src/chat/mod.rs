// Chat module
// This module grounds each conversational turn in search results before asking the language model

#[cfg(test)]
mod tests;

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ChatConfig;
use crate::index::{IndexError, SearchResult};
use crate::llm::{ChatMessage, LanguageModel, Role};
use crate::search::{SearchHit, SearchRequest, SearchService};
use crate::{AmenityError, Result};

/// One prior message supplied by the caller
pub type ConversationTurn = ChatMessage;

const GROUNDING_HEADER: &str = "RELEVANT PROJECT RECORDS:";
const NO_RESULTS_NOTE: &str = "No matching project records were found for this message.";
const DEGRADED_NOTE: &str = "Project search is currently unavailable. Answer without project \
records and tell the user that listings could not be consulted.";

/// Result of one conversational turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub response: String,
    pub used_results: Vec<SearchResult>,
    /// Retrieval failed and the reply was generated without grounding
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatOptions {
    pub max_history_turns: usize,
    pub top_k: usize,
    pub system_prompt: String,
}

impl From<&ChatConfig> for ChatOptions {
    #[inline]
    fn from(config: &ChatConfig) -> Self {
        Self {
            max_history_turns: config.max_history_turns,
            top_k: config.top_k,
            system_prompt: config.system_prompt.clone(),
        }
    }
}

impl Default for ChatOptions {
    #[inline]
    fn default() -> Self {
        Self::from(&ChatConfig::default())
    }
}

/// What retrieval produced for a turn
#[derive(Debug, Clone, PartialEq)]
pub enum Grounding {
    Results(Vec<SearchHit>),
    Degraded(IndexError),
}

/// Stateless per-turn coordinator: search, assemble the prompt, generate.
pub struct ChatOrchestrator {
    search: SearchService,
    llm: Arc<dyn LanguageModel>,
    options: ChatOptions,
}

impl ChatOrchestrator {
    #[inline]
    pub fn new(search: SearchService, llm: Arc<dyn LanguageModel>, options: ChatOptions) -> Self {
        Self {
            search,
            llm,
            options,
        }
    }

    /// Answer `message` given the caller-supplied `history`.
    ///
    /// Retrieval failures degrade the turn instead of failing it; language
    /// model failures are returned as errors.
    #[inline]
    pub async fn handle_turn(
        &self,
        message: &str,
        history: &[ConversationTurn],
    ) -> Result<ChatResponse> {
        if message.trim().is_empty() {
            return Err(AmenityError::Index(IndexError::InvalidRequest(
                "current_message must not be empty".to_string(),
            )));
        }

        let grounding = self.retrieve(message).await;
        let prompt = self.build_prompt(message, history, &grounding);
        debug!("Prompt assembled with {} messages", prompt.len());

        let response = self.llm.generate(&prompt).await?;

        Ok(match grounding {
            Grounding::Results(hits) => ChatResponse {
                response,
                used_results: hits
                    .into_iter()
                    .map(|hit| SearchResult {
                        record_id: hit.record_id,
                        score: hit.score,
                        rank: hit.rank,
                    })
                    .collect(),
                degraded: false,
                degraded_reason: None,
            },
            Grounding::Degraded(error) => ChatResponse {
                response,
                used_results: Vec::new(),
                degraded: true,
                degraded_reason: Some(error.to_string()),
            },
        })
    }

    async fn retrieve(&self, message: &str) -> Grounding {
        let request = SearchRequest::new(message, self.options.top_k);
        match self.search.search(&request).await {
            Ok(results) => {
                info!(
                    "Grounding turn with {} records from generation {}",
                    results.hits.len(),
                    results.version
                );
                Grounding::Results(results.hits)
            }
            Err(e) => {
                warn!("Retrieval failed, answering without grounding: {}", e);
                Grounding::Degraded(e)
            }
        }
    }

    /// Deterministic prompt: system prompt, the last N history turns (oldest
    /// first), the user message, then one system message with the grounding.
    #[inline]
    pub fn build_prompt(
        &self,
        message: &str,
        history: &[ConversationTurn],
        grounding: &Grounding,
    ) -> Vec<ChatMessage> {
        let history: Vec<&ConversationTurn> = history
            .iter()
            .filter(|turn| turn.role != Role::System)
            .collect();
        let start = history.len().saturating_sub(self.options.max_history_turns);

        let mut prompt = Vec::with_capacity(history.len() - start + 3);
        prompt.push(ChatMessage::system(self.options.system_prompt.clone()));
        prompt.extend(history[start..].iter().map(|turn| (*turn).clone()));
        prompt.push(ChatMessage::user(message));
        prompt.push(ChatMessage::system(grounding_context(grounding)));
        prompt
    }
}

/// Render retrieval output as the grounding system message
#[inline]
pub fn grounding_context(grounding: &Grounding) -> String {
    let hits = match grounding {
        Grounding::Degraded(_) => return DEGRADED_NOTE.to_string(),
        Grounding::Results(hits) if hits.is_empty() => return NO_RESULTS_NOTE.to_string(),
        Grounding::Results(hits) => hits,
    };

    let mut context = String::from(GROUNDING_HEADER);
    for hit in hits {
        let _ = write!(
            context,
            "\n{}. [id {}] (score {:.3}) {}",
            hit.rank, hit.record_id, hit.score, hit.text
        );
        if !hit.metadata.is_empty() {
            let metadata: Vec<String> = hit
                .metadata
                .iter()
                .map(|(key, value)| format!("{}: {}", key, value))
                .collect();
            let _ = write!(context, " | {}", metadata.join("; "));
        }
    }
    context
}
