//! Bounded per-session conversation log.
//!
//! Two limits apply: the store keeps at most `max_messages` recent
//! entries (sliding window, trimmed from the head), and context assembly
//! additionally applies a token budget over the tail. Payloads are
//! optionally gzip-encoded; the reader tolerates both encodings so the
//! flag can be flipped without migration.

use std::io::{Read, Write};
use std::sync::Arc;

use base64::Engine;

use tb_domain::config::ConversationSettings;
use tb_domain::message::ConversationMessage;
use tb_domain::{Error, Result};
use tb_store::{keys, StateStore};

/// Sentinel prefix for gzip+base64 framed entries.
const GZIP_PREFIX: &str = "gz:";

pub struct ConversationStore {
    store: Arc<dyn StateStore>,
    config: ConversationSettings,
}

impl ConversationStore {
    pub fn new(store: Arc<dyn StateStore>, config: ConversationSettings) -> Self {
        Self { store, config }
    }

    /// Append one message, enforcing the sliding window and TTL.
    pub async fn append(&self, session_id: &str, message: &ConversationMessage) -> Result<()> {
        let key = keys::conversation(session_id);
        let encoded = self.encode(message)?;
        self.store.list_push(&key, &encoded).await?;
        self.store
            .list_trim_to_tail(&key, self.config.max_messages)
            .await?;
        if let Some(ttl) = self.config.history_ttl {
            self.store.expire(&key, ttl).await?;
        }
        Ok(())
    }

    /// The full stored log, oldest first. Undecodable entries are skipped
    /// rather than failing the whole read.
    pub async fn load(&self, session_id: &str) -> Result<Vec<ConversationMessage>> {
        let key = keys::conversation(session_id);
        let raw = self.store.list_range(&key).await?;
        let mut messages = Vec::with_capacity(raw.len());
        for entry in raw {
            match decode(&entry) {
                Ok(message) => messages.push(message),
                Err(err) => {
                    tracing::warn!(session_id, error = %err, "skipping undecodable conversation entry");
                }
            }
        }
        Ok(messages)
    }

    /// The tail of the log fitting the configured token budget, in
    /// append order.
    pub async fn window(&self, session_id: &str) -> Result<Vec<ConversationMessage>> {
        let messages = self.load(session_id).await?;
        let mut budget = self.config.max_history_tokens;
        let mut start = messages.len();
        for (idx, message) in messages.iter().enumerate().rev() {
            let cost = message.approx_tokens();
            if cost > budget {
                break;
            }
            budget -= cost;
            start = idx;
        }
        Ok(messages[start..].to_vec())
    }

    /// Drop the whole log for a session.
    pub async fn clear(&self, session_id: &str) -> Result<()> {
        self.store
            .list_trim_to_tail(&keys::conversation(session_id), 0)
            .await
    }

    fn encode(&self, message: &ConversationMessage) -> Result<String> {
        let json = serde_json::to_string(message)?;
        if !self.config.compress {
            return Ok(json);
        }
        Ok(encode_gzip(&json)?)
    }
}

fn encode_gzip(json: &str) -> Result<String> {
    let mut encoder =
        flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(json.as_bytes())?;
    let compressed = encoder.finish()?;
    Ok(format!(
        "{GZIP_PREFIX}{}",
        base64::engine::general_purpose::STANDARD.encode(compressed)
    ))
}

/// Decode one stored entry, accepting both raw JSON and gzip framing.
fn decode(entry: &str) -> Result<ConversationMessage> {
    let json = match entry.strip_prefix(GZIP_PREFIX) {
        Some(b64) => {
            let compressed = base64::engine::general_purpose::STANDARD
                .decode(b64)
                .map_err(|e| Error::Integrity(format!("bad base64 framing: {e}")))?;
            let mut decoder = flate2::read::GzDecoder::new(compressed.as_slice());
            let mut json = String::new();
            decoder
                .read_to_string(&mut json)
                .map_err(|e| Error::Integrity(format!("bad gzip payload: {e}")))?;
            json
        }
        None => entry.to_owned(),
    };
    Ok(serde_json::from_str(&json)?)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use tb_store::MemoryStore;

    fn store_with(config: ConversationSettings) -> ConversationStore {
        ConversationStore::new(Arc::new(MemoryStore::new()), config)
    }

    #[tokio::test]
    async fn append_and_load_roundtrip() {
        let conv = store_with(ConversationSettings::default());
        conv.append("s1", &ConversationMessage::user("hello"))
            .await
            .unwrap();
        conv.append("s1", &ConversationMessage::model("hi there"))
            .await
            .unwrap();

        let messages = conv.load("s1").await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "hello");
        assert_eq!(messages[1].content, "hi there");
    }

    #[tokio::test]
    async fn window_limit_keeps_most_recent() {
        let conv = store_with(ConversationSettings {
            max_messages: 3,
            ..Default::default()
        });
        for i in 0..6 {
            conv.append("s1", &ConversationMessage::user(format!("m{i}")))
                .await
                .unwrap();
        }
        let messages = conv.load("s1").await.unwrap();
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4", "m5"]);
    }

    #[tokio::test]
    async fn load_returns_suffix_of_append_order() {
        let conv = store_with(ConversationSettings {
            max_messages: 4,
            ..Default::default()
        });
        let all: Vec<String> = (0..10).map(|i| format!("msg-{i}")).collect();
        for content in &all {
            conv.append("s1", &ConversationMessage::user(content))
                .await
                .unwrap();
        }
        let loaded: Vec<String> = conv
            .load("s1")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert!(all.ends_with(&loaded));
    }

    #[tokio::test]
    async fn token_budget_takes_fitting_tail() {
        let conv = store_with(ConversationSettings {
            max_messages: 50,
            max_history_tokens: 10, // each 20-char message costs 5 tokens
            ..Default::default()
        });
        for i in 0..4 {
            conv.append("s1", &ConversationMessage::user(format!("{i}{}", "x".repeat(18))))
                .await
                .unwrap();
        }
        let window = conv.window("s1").await.unwrap();
        assert_eq!(window.len(), 2);
        assert!(window[0].content.starts_with('2'));
        assert!(window[1].content.starts_with('3'));
    }

    #[tokio::test]
    async fn oversized_single_message_yields_empty_window() {
        let conv = store_with(ConversationSettings {
            max_history_tokens: 5,
            ..Default::default()
        });
        conv.append("s1", &ConversationMessage::user("x".repeat(100)))
            .await
            .unwrap();
        assert!(conv.window("s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn gzip_roundtrip_is_identity() {
        let conv = store_with(ConversationSettings {
            compress: true,
            ..Default::default()
        });
        let message = ConversationMessage::model("compressed payload with some length to it");
        conv.append("s1", &message).await.unwrap();

        let loaded = conv.load("s1").await.unwrap();
        assert_eq!(loaded, vec![message]);
    }

    #[test]
    fn gzip_frame_has_sentinel() {
        let encoded = encode_gzip("{\"x\":1}").unwrap();
        assert!(encoded.starts_with(GZIP_PREFIX));
    }

    #[tokio::test]
    async fn reader_tolerates_mixed_encodings() {
        // Write compressed, read with compression off, and vice versa.
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let compressed_writer = ConversationStore::new(
            store.clone(),
            ConversationSettings {
                compress: true,
                ..Default::default()
            },
        );
        let plain_writer = ConversationStore::new(
            store.clone(),
            ConversationSettings::default(),
        );

        compressed_writer
            .append("s1", &ConversationMessage::user("first (gzipped)"))
            .await
            .unwrap();
        plain_writer
            .append("s1", &ConversationMessage::user("second (raw)"))
            .await
            .unwrap();

        let loaded = plain_writer.load("s1").await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].content, "first (gzipped)");
        assert_eq!(loaded[1].content, "second (raw)");
    }

    #[tokio::test]
    async fn corrupt_entries_are_skipped() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let conv = ConversationStore::new(store.clone(), ConversationSettings::default());
        conv.append("s1", &ConversationMessage::user("good"))
            .await
            .unwrap();
        store
            .list_push(&keys::conversation("s1"), "gz:!!!not-base64!!!")
            .await
            .unwrap();

        let loaded = conv.load("s1").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].content, "good");
    }

    #[tokio::test]
    async fn clear_empties_the_log() {
        let conv = store_with(ConversationSettings::default());
        conv.append("s1", &ConversationMessage::user("hello"))
            .await
            .unwrap();
        conv.clear("s1").await.unwrap();
        assert!(conv.load("s1").await.unwrap().is_empty());
    }
}
