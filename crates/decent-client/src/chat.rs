use std::fmt;

use serde::{Deserialize, Serialize};

/// Who wrote a chat line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Author {
    #[serde(rename = "self")]
    Me,
    Peer,
}

impl fmt::Display for Author {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Author::Me => write!(f, "self"),
            Author::Peer => write!(f, "peer"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub text: String,
    pub sender: Author,
}

/// Append-only display log for one conversation.
#[derive(Debug, Clone, Default)]
pub struct ChatLog {
    entries: Vec<ChatEntry>,
}

impl ChatLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, text: impl Into<String>, sender: Author) -> &ChatEntry {
        self.entries.push(ChatEntry {
            text: text.into(),
            sender,
        });
        &self.entries[self.entries.len() - 1]
    }

    /// Decode bytes received from the peer. Invalid UTF-8 is replaced
    /// rather than rejected.
    pub fn push_received(&mut self, data: &[u8]) -> &ChatEntry {
        self.push(String::from_utf8_lossy(data), Author::Peer)
    }

    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
