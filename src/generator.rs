//! Reply generation
//!
//! Replies come from an OpenAI-compatible chat completions endpoint, seeded
//! with a prompt built from the call's context. When the model is rate
//! limited or otherwise unavailable a small keyword table answers instead,
//! so the caller always hears something.

use crate::config::LlmConfig;
use crate::context::ConversationContext;
use crate::error::{ServiceError, ServiceResult};
use crate::intent::{detect_intent, is_affirmative, is_negative, Intent};
use crate::records::{Speaker, TranscriptTurn};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, warn};

/// Longest reply spoken on a call
pub const MAX_REPLY_SENTENCES: usize = 3;

#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    /// A short spoken reply. Never empty.
    async fn generate(
        &self,
        utterance: &str,
        context: &ConversationContext,
        history: &[TranscriptTurn],
    ) -> String;
}

/// Most recent turns of the conversation, oldest first
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    turns: VecDeque<TranscriptTurn>,
    capacity: usize,
}

impl ConversationHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            turns: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, turn: TranscriptTurn) {
        if self.capacity == 0 {
            return;
        }
        while self.turns.len() >= self.capacity {
            self.turns.pop_front();
        }
        self.turns.push_back(turn);
    }

    pub fn snapshot(&self) -> Vec<TranscriptTurn> {
        self.turns.iter().cloned().collect()
    }

}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

pub struct ChatCompletionGenerator {
    client: reqwest::Client,
    config: LlmConfig,
}

impl ChatCompletionGenerator {
    pub fn new(client: reqwest::Client, config: LlmConfig) -> Self {
        Self { client, config }
    }

    /// One completion call; errors are returned rather than replaced.
    pub async fn try_generate(
        &self,
        utterance: &str,
        context: &ConversationContext,
        history: &[TranscriptTurn],
    ) -> ServiceResult<String> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage {
            role: "system",
            content: system_prompt(context),
        });
        messages.extend(history.iter().map(|turn| ChatMessage {
            role: match turn.speaker {
                Speaker::Caller => "user",
                Speaker::Assistant => "assistant",
            },
            content: turn.text.clone(),
        }));
        messages.push(ChatMessage {
            role: "user",
            content: utterance.to_string(),
        });

        let body = ChatRequest {
            model: &self.config.model,
            messages,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .timeout(Duration::from_secs(15))
            .json(&body)
            .send()
            .await?;

        let parsed: ChatResponse = ServiceError::check(response).await?.json().await?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        let reply = limit_sentences(&content, MAX_REPLY_SENTENCES);
        if reply.is_empty() {
            return Err(ServiceError::EmptyResponse);
        }
        debug!("🤖 Reply: {}", reply);
        Ok(reply)
    }
}

#[async_trait]
impl ResponseGenerator for ChatCompletionGenerator {
    async fn generate(
        &self,
        utterance: &str,
        context: &ConversationContext,
        history: &[TranscriptTurn],
    ) -> String {
        match self.try_generate(utterance, context, history).await {
            Ok(reply) => reply,
            Err(ServiceError::RateLimited { retry_after }) => {
                warn!("⏳ Language model rate limited (retry after {:?}s), using fallback reply", retry_after);
                fallback_reply(utterance, context)
            }
            Err(e) => {
                warn!("Language model unavailable, using fallback reply: {}", e);
                fallback_reply(utterance, context)
            }
        }
    }
}

fn first_name(context: &ConversationContext) -> &str {
    let name = context.patient().name.trim();
    name.split_whitespace().next().unwrap_or(name)
}

fn doctor_phrase(context: &ConversationContext) -> String {
    context
        .doctor()
        .map(|d| format!(" with {}", d.name))
        .unwrap_or_default()
}

fn spoken_date(at: chrono::DateTime<chrono::Utc>) -> String {
    at.format("%A, %B %-d at %-I:%M %p").to_string()
}

/// System prompt for the language model
pub fn system_prompt(context: &ConversationContext) -> String {
    let patient = context.patient();
    let mut prompt = String::from(
        "You are a friendly assistant calling on behalf of a medical clinic. \
         You are speaking on the phone, so answer in one to three short sentences \
         of plain spoken language with no lists, markup or abbreviations. \
         Never give medical advice; offer to have the clinic call back instead.\n\n",
    );

    prompt.push_str(&format!("Patient: {}.\n", patient.name));
    if patient.language != "en" {
        prompt.push_str(&format!("Reply in the patient's preferred language ({}).\n", patient.language));
    }
    if !patient.medical_history.is_empty() {
        prompt.push_str(&format!("Relevant history: {}.\n", patient.medical_history.join(", ")));
    }
    if let Some(doctor) = context.doctor() {
        match &doctor.specialization {
            Some(spec) => prompt.push_str(&format!("Doctor: {} ({}).\n", doctor.name, spec)),
            None => prompt.push_str(&format!("Doctor: {}.\n", doctor.name)),
        }
    }

    match context {
        ConversationContext::Appointment { appointment, .. } => {
            prompt.push_str(&format!(
                "Purpose: confirm the appointment on {}",
                spoken_date(appointment.scheduled_at)
            ));
            if let Some(reason) = &appointment.reason {
                prompt.push_str(&format!(" for {}", reason));
            }
            prompt.push_str(
                ". If the patient wants a different time, tell them the front desk will \
                 call to reschedule. If they want to cancel, acknowledge it politely.",
            );
        }
        ConversationContext::FollowUp { follow_up, .. } => {
            prompt.push_str(&format!(
                "Purpose: follow up on {} (due {}). Ask how they are feeling and whether \
                 they have any concerns for the doctor.",
                follow_up.reason,
                follow_up.due_on.format("%B %-d")
            ));
            if let Some(notes) = &follow_up.notes {
                prompt.push_str(&format!(" Notes: {}.", notes));
            }
        }
        ConversationContext::CheckIn { .. } => {
            prompt.push_str(
                "Purpose: a general check-in. Ask how they are doing and whether they \
                 need anything from the clinic.",
            );
        }
    }
    prompt
}

/// First thing the assistant says once the call is connected
pub fn opening_line(context: &ConversationContext) -> String {
    let name = first_name(context);
    match context {
        ConversationContext::Appointment { appointment, .. } => format!(
            "Hello {}, this is the clinic calling about your appointment{} on {}. \
             Can you confirm you'll be able to make it?",
            name,
            doctor_phrase(context),
            spoken_date(appointment.scheduled_at)
        ),
        ConversationContext::FollowUp { follow_up, .. } => format!(
            "Hello {}, this is the clinic calling to follow up on your {}. How have you been feeling?",
            name, follow_up.reason
        ),
        ConversationContext::CheckIn { .. } => format!(
            "Hello {}, this is the clinic checking in. How are you feeling today?",
            name
        ),
    }
}

/// Deterministic reply used when the language model cannot answer
pub fn fallback_reply(utterance: &str, context: &ConversationContext) -> String {
    match (detect_intent(utterance), context) {
        (Intent::Cancel, ConversationContext::Appointment { .. }) => {
            "I understand, I'll let the clinic know you'd like to cancel. Thank you for telling us.".to_string()
        }
        (Intent::Cancel, _) => {
            "Understood, I'll pass that on to the clinic. Thank you.".to_string()
        }
        (Intent::Reschedule, _) => {
            "No problem, the front desk will call you to find a better time.".to_string()
        }
        (Intent::Confirm, ConversationContext::Appointment { appointment, .. }) => format!(
            "Great, you're all set for {}. See you then!",
            spoken_date(appointment.scheduled_at)
        ),
        (Intent::Confirm, _) => {
            "Thank you, I've noted that. Is there anything else you'd like the doctor to know?".to_string()
        }
        (Intent::Unclear, _) if is_negative(utterance) => {
            "I'm sorry to hear that. Would you like someone from the clinic to call you back?".to_string()
        }
        (Intent::Unclear, _) if is_affirmative(utterance) => {
            "Thank you. Is there anything else I can help you with?".to_string()
        }
        (Intent::Unclear, _) => "Sorry, I didn't quite catch that. Could you say that again?".to_string(),
    }
}

const ABBREVIATIONS: &[&str] = &["dr", "mr", "mrs", "ms", "st", "jr", "sr"];

/// Keep at most `max` sentences of `text`.
pub fn limit_sentences(text: &str, max: usize) -> String {
    let text = text.trim();
    let mut sentences = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        let at_boundary = chars.peek().map_or(true, |(_, next)| next.is_whitespace());
        if !at_boundary {
            continue;
        }
        let word = text[..i].rsplit(char::is_whitespace).next().unwrap_or("");
        if c == '.' && ABBREVIATIONS.contains(&word.to_lowercase().as_str()) {
            continue;
        }
        sentences += 1;
        if sentences == max {
            return text[..=i].to_string();
        }
    }
    text.to_string()
}
