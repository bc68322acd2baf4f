use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::driver::{AutomationDriver, Element};
use crate::error::{AgentResult, DriverError};
use crate::profile::UiProfile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SenderRole {
    Myself,
    Other,
}

/// Latest message seen in an opened thread. Only the hash outlives the cycle.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub sender: SenderRole,
    pub sender_name: String,
    pub text: String,
    pub observed_at: DateTime<Utc>,
    pub hash: String,
}

impl Message {
    pub fn new(sender_name: &str, text: &str, profile: &UiProfile, account: Option<&str>) -> Self {
        Self {
            sender: sender_role(text, profile, account),
            sender_name: sender_name.to_string(),
            text: text.to_string(),
            observed_at: Utc::now(),
            hash: content_hash(sender_name, text),
        }
    }
}

const MIN_MESSAGE_CHARS: usize = 5;
const MAX_MESSAGE_CHARS: usize = 500;

static RELATIVE_TIME: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d+[hms] ago\b").expect("valid regex"));
static PRESENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(active|online|offline)\b").expect("valid regex"));

/// Message text reduced to what stays stable between scans.
pub fn normalize_content(text: &str) -> String {
    let lower = text.to_lowercase();
    let without_time = RELATIVE_TIME.replace_all(&lower, " ");
    let without_presence = PRESENCE.replace_all(&without_time, " ");
    let words: Vec<&str> = without_presence.split_whitespace().take(5).collect();
    if words.is_empty() {
        "empty_message".to_string()
    } else {
        words.join(" ")
    }
}

pub fn normalize_sender(sender: &str) -> String {
    let sender = sender.trim().to_lowercase();
    if sender.is_empty() || sender == "unknown" || sender == "user" {
        "unknown_user".to_string()
    } else {
        sender
    }
}

pub fn content_hash(sender: &str, text: &str) -> String {
    let key = format!("{}:{}", normalize_sender(sender), normalize_content(text));
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Ledger key for a thread at its current latest message.
pub fn ledger_key(thread_id: &str, message_hash: &str) -> String {
    hex::encode(Sha256::digest(format!("{}|{}", thread_id, message_hash).as_bytes()))
}

pub fn sender_role(text: &str, profile: &UiProfile, account: Option<&str>) -> SenderRole {
    let lower = text.to_lowercase();
    let own_phrase = profile
        .self_phrases
        .iter()
        .any(|p| !p.trim().is_empty() && lower.contains(&p.to_lowercase()));
    let own_name = account
        .map(|a| a.trim().to_lowercase())
        .filter(|a| !a.is_empty())
        .map(|a| lower.contains(&a))
        .unwrap_or(false);
    if own_phrase || own_name {
        SenderRole::Myself
    } else {
        SenderRole::Other
    }
}

/// Lowest plausible message text on screen.
pub fn pick_latest(elements: &[Element]) -> Option<&Element> {
    elements
        .iter()
        .filter(|e| {
            let len = e.text.trim().chars().count();
            len > MIN_MESSAGE_CHARS && len < MAX_MESSAGE_CHARS
        })
        .max_by_key(|e| e.bounds.map(|b| b.y).unwrap_or(i32::MIN))
}

pub async fn latest_message(
    driver: &dyn AutomationDriver,
    profile: &UiProfile,
    thread_label: &str,
    account: Option<&str>,
) -> AgentResult<Option<Message>> {
    let texts = match driver.locate(&profile.message_text_locator).await {
        Ok(found) => found,
        Err(DriverError::NoSuchElement(_)) => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    Ok(pick_latest(&texts).map(|e| Message::new(thread_label, e.text.trim(), profile, account)))
}
