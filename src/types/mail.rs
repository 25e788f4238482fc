//! Mailbox data exchanged with the mail driver

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const INBOX: &str = "INBOX";
pub const UNREAD: &str = "UNREAD";

/// Thread listing request
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub folder: String,
    #[serde(default)]
    pub label_ids: Vec<String>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub max_results: Option<u32>,
    #[serde(default)]
    pub page_token: Option<String>,
}

impl ListQuery {
    pub fn folder(folder: impl Into<String>) -> Self {
        Self {
            folder: folder.into(),
            ..Default::default()
        }
    }

    pub fn max_results(mut self, max: u32) -> Self {
        self.max_results = Some(max);
        self
    }

    pub fn page_token(mut self, token: Option<String>) -> Self {
        self.page_token = token;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadSummary {
    pub id: String,
    #[serde(default)]
    pub history_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadList {
    pub threads: Vec<ThreadSummary>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailMessage {
    pub id: String,
    pub thread_id: String,
    pub from: String,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
}

impl MailMessage {
    pub fn snippet(&self) -> String {
        self.body.chars().take(200).collect()
    }

    /// Bare address of the sender, falling back to the raw header.
    pub fn sender_address(&self) -> String {
        match mailparse::addrparse(&self.from) {
            Ok(list) => list
                .iter()
                .find_map(|addr| match addr {
                    mailparse::MailAddr::Single(info) => Some(info.addr.clone()),
                    mailparse::MailAddr::Group(group) => {
                        group.addrs.first().map(|info| info.addr.clone())
                    }
                })
                .unwrap_or_else(|| self.from.clone()),
            Err(_) => self.from.clone(),
        }
    }
}

/// A thread as fetched from the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadDetail {
    pub id: String,
    #[serde(default)]
    pub history_id: Option<String>,
    #[serde(default)]
    pub messages: Vec<MailMessage>,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl ThreadDetail {
    pub fn latest_message(&self) -> Option<&MailMessage> {
        self.messages.last()
    }

    pub fn sender(&self) -> &str {
        self.latest_message().map(|m| m.from.as_str()).unwrap_or("")
    }

    pub fn subject(&self) -> &str {
        self.latest_message()
            .map(|m| m.subject.as_str())
            .unwrap_or("")
    }

    pub fn body(&self) -> &str {
        self.latest_message().map(|m| m.body.as_str()).unwrap_or("")
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l.eq_ignore_ascii_case(label))
    }
}

/// One entry of the provider change log
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub id: String,
    #[serde(default)]
    pub messages_added: Vec<HistoryMessage>,
    #[serde(default)]
    pub labels_added: Vec<HistoryLabelChange>,
    #[serde(default)]
    pub labels_removed: Vec<HistoryLabelChange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryMessage {
    pub message_id: String,
    pub thread_id: String,
    #[serde(default)]
    pub label_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryLabelChange {
    pub message_id: String,
    pub thread_id: String,
    pub label_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    pub history: Vec<HistoryRecord>,
    /// Cursor to store once this page has been processed
    pub history_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelModification {
    #[serde(default)]
    pub add_labels: Vec<String>,
    #[serde(default)]
    pub remove_labels: Vec<String>,
}

impl LabelModification {
    pub fn add(label: impl Into<String>) -> Self {
        Self {
            add_labels: vec![label.into()],
            remove_labels: Vec::new(),
        }
    }

    pub fn remove(label: impl Into<String>) -> Self {
        Self {
            add_labels: Vec::new(),
            remove_labels: vec![label.into()],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.add_labels.is_empty() && self.remove_labels.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftRequest {
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftRef {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    /// Base64 encoded content
    pub data: String,
}

/// A message ready to hand to the provider for delivery
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingEmail {
    pub to: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bcc: Vec<String>,
    pub subject: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentMessage {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchResponse {
    pub history_id: String,
    pub expiration: DateTime<Utc>,
}

/// Push notification payload from the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushNotification {
    pub email_address: String,
    pub history_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledEmailStatus {
    Scheduled,
    Queued,
    Sent,
    Failed,
    Cancelled,
}

impl ScheduledEmailStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Queued => "queued",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "queued" => Self::Queued,
            "sent" => Self::Sent,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => Self::Scheduled,
        }
    }
}

/// An email the user asked to send later
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledEmail {
    pub id: String,
    pub connection_id: String,
    pub email: OutgoingEmail,
    pub send_at: DateTime<Utc>,
    pub status: ScheduledEmailStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sender_address_strips_display_name() {
        let msg = MailMessage {
            id: "m1".into(),
            thread_id: "t1".into(),
            from: "Jane Doe <jane@example.com>".into(),
            to: vec![],
            subject: String::new(),
            body: String::new(),
            labels: vec![],
            received_at: None,
        };
        assert_eq!(msg.sender_address(), "jane@example.com");
    }

    #[test]
    fn test_history_record_defaults() {
        let record: HistoryRecord = serde_json::from_str(r#"{"id": "12"}"#).unwrap();
        assert!(record.messages_added.is_empty());
        assert!(record.labels_removed.is_empty());
    }
}
