//! Hybrid message bus: guaranteed inbox-file delivery plus a best-effort HTTP fast path,
//! with at-most-once receipt tracking via a deliveries log.

use crate::errors::RuntimeError;
use crate::registry::Registry;
use crate::signing::{AuthorizedKeys, Identity, SigningPolicy};
use crate::store::AppendLog;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Message type tag. `Structured` is the escape hatch for payloads future
/// revisions add without needing a new enum case everywhere a `MessageType` is matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskAssign,
    TaskComplete,
    Message,
    Question,
    StatusUpdate,
    Shutdown,
}

/// Tagged-union message body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Structured(serde_json::Value),
}

impl MessageContent {
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Structured(v) => v.to_string(),
        }
    }
}

/// A file attachment carried by `message-multi`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub mime_type: String,
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(bytes).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// A signed (or unsigned) envelope as persisted to an inbox file or the global messages log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub from: String,
    /// An agent id, or the literal `"broadcast"`.
    pub to: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub content: MessageContent,
    pub timestamp: DateTime<Utc>,
    pub delivered: bool,
    pub delivered_at: Option<DateTime<Utc>>,
    pub attachments: Vec<Attachment>,
    pub nonce: String,
    pub signature: Option<String>,
}

impl Envelope {
    pub fn is_for(&self, agent_id: &str) -> bool {
        self.to == agent_id || self.to == "broadcast"
    }
}

/// One per (message, recipient); existence marks that recipient has processed the message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub message_id: String,
    pub delivered_to: String,
    pub delivered_at: DateTime<Utc>,
}

/// Invoked once per undelivered [`Envelope`] addressed to this agent. Implemented by the
/// agentic loop in the real runtime; tests use closures or a recording stub.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope);
}

#[async_trait]
impl<F> MessageHandler for F
where
F: Fn(&Envelope) + Send + Sync,
{
    async fn handle(&self, envelope: &Envelope) {
        self(envelope)
    }
}

/// The hybrid messaging layer for one agent process.
pub struct MessageBus {
    self_id: String,
    shared_dir: PathBuf,
    messages_log: AppendLog,
    deliveries_log: AppendLog,
    registry: Arc<Registry>,
    http_client: reqwest::Client,
    identity: Option<Identity>,
    authorized_keys: AuthorizedKeys,
    policy: SigningPolicy,
    /// In-memory cache of `messageId -> delivered?`, seeded from `deliveries.jsonl` at startup
    /// and kept current as this process marks its own deliveries.
    seen: Mutex<HashSet<String>>,
}

impl MessageBus {
    pub fn new(self_id: impl Into<String>, shared_dir: impl AsRef<Path>, registry: Arc<Registry>) -> Self {
        let shared_dir = shared_dir.as_ref().to_path_buf();
        MessageBus {
            self_id: self_id.into(),
            messages_log: AppendLog::new(shared_dir.join("messages.jsonl")),
            deliveries_log: AppendLog::new(shared_dir.join("deliveries.jsonl")),
            shared_dir,
            registry,
            http_client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(5))
                .build()
                .expect("reqwest client"),
            identity: None,
            authorized_keys: AuthorizedKeys::empty(),
            policy: SigningPolicy::default(),
            seen: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_authorized_keys(mut self, keys: AuthorizedKeys) -> Self {
        self.authorized_keys = keys;
        self
    }

    fn inbox_path(&self, agent_id: &str) -> PathBuf {
        self.shared_dir.join("inboxes").join(format!("{}.jsonl", agent_id))
    }

    /// Build and persist an envelope, then best-effort fan it out over HTTP.
    ///
    /// 1. Guaranteed path: append to the recipient's inbox file; on write failure, append to the
    /// global messages log instead.
    /// 2. Fast path: if the recipient is known and reachable, `POST` to its `/api/message` (or
    /// `/api/message-multi` when attachments are present). HTTP failures are logged and
    /// ignored — the inbox file is the system of record.
    pub async fn send(
        &self,
        to: &str,
        message_type: MessageType,
        content: MessageContent,
        attachments: Vec<Attachment>,
    ) -> Result<Envelope, RuntimeError> {
        let timestamp = Utc::now();
        let nonce = Uuid::new_v4().to_string();
        let content_text = content.as_text();
        let id = Uuid::new_v4().to_string();
        let signature = self.identity.as_ref().map(|identity| {
                identity.sign(&id, &self.self_id, to, &timestamp.to_rfc3339(), &nonce, &content_text)
        });

        let envelope = Envelope {
            id,
            from: self.self_id.clone(),
            to: to.to_string(),
            message_type,
            content,
            timestamp,
            delivered: false,
            delivered_at: None,
            attachments,
            nonce,
            signature,
        };

        self.persist(&envelope)?;
        self.try_fast_path(&envelope).await;
        Ok(envelope)
    }

    fn persist(&self, envelope: &Envelope) -> Result<(), RuntimeError> {
        // A broadcast has no single recipient inbox; it lives in the global log and every
        // process discovers it via catch-up / the log watcher, each appending its own delivery
        // record.
        if envelope.to == "broadcast" {
            self.messages_log.append(envelope)?;
            return Ok(());
        }
        let inbox = AppendLog::new(self.inbox_path(&envelope.to));
        if inbox.append(envelope).is_err() {
            log::warn!("inbox write failed for {}, falling back to global log", envelope.to);
            self.messages_log.append(envelope)?;
        }
        Ok(())
    }

    async fn try_fast_path(&self, envelope: &Envelope) {
        if envelope.to == "broadcast" {
            return;
        }
        let registration = match self.registry.get(&envelope.to) {
            Ok(Some(r)) => r,
            _ => return,
        };
        let Some(url) = registration.url else {
            return;
        };
        let probe = self
            .http_client
            .get(format!("{}/api/status", url))
            .timeout(std::time::Duration::from_secs(2))
            .send()
            .await;
        if probe.is_err() {
            return;
        }
        let endpoint = if envelope.attachments.is_empty() {
            format!("{}/api/message", url)
        } else {
            format!("{}/api/message-multi", url)
        };
        let timeout = if envelope.attachments.is_empty() {
            std::time::Duration::from_secs(5)
        } else {
            std::time::Duration::from_secs(30)
        };
        if let Err(e) = self
            .http_client
            .post(&endpoint)
            .timeout(timeout)
            .json(envelope)
            .send()
            .await
        {
            log::warn!("fast-path POST to {} failed (inbox remains authoritative): {}", endpoint, e);
        }
    }

    /// Verify an incoming envelope's signature against the policy.
    pub fn verify(&self, envelope: &Envelope) -> Result<(), RuntimeError> {
        let Some(signature) = &envelope.signature else {
            if self.policy.reject_unsigned_from_known_senders
            && !self.authorized_keys.is_empty()
            && self.authorized_keys.contains(&envelope.from)
            {
                return Err(RuntimeError::Unauthorized(format!(
                            "unsigned message from known sender {}",
                            envelope.from
                )));
            }
            return Ok(());
        };
        let ok = self
            .authorized_keys
            .verify(
            &envelope.from,
            &envelope.id,
            &envelope.from,
            &envelope.to,
            &envelope.timestamp.to_rfc3339(),
            &envelope.nonce,
            &envelope.content.as_text(),
            signature,
        )
            .map_err(|e| RuntimeError::Unauthorized(e.to_string()))?;
        if !ok {
            return Err(RuntimeError::Unauthorized(format!(
                        "invalid signature from {}",
                        envelope.from
            )));
        }
        Ok(())
    }

    /// Process one candidate envelope: verify, filter by recipient, dedup against the deliveries
    /// cache, invoke the handler, and append exactly one delivery record. At-most-once per
    /// (message, recipient).
    pub async fn process(&self, envelope: &Envelope, handler: &dyn MessageHandler) -> Result<bool, RuntimeError> {
        if !envelope.is_for(&self.self_id) {
            return Ok(false);
        }
        self.verify(envelope)?;
        {
            let mut seen = self.seen.lock().await;
            if seen.contains(&envelope.id) {
                return Ok(false);
            }
            seen.insert(envelope.id.clone());
        }
        handler.handle(envelope).await;
        self.deliveries_log.append(&DeliveryRecord {
                message_id: envelope.id.clone(),
                delivered_to: self.self_id.clone(),
                delivered_at: Utc::now(),
        })?;
        Ok(true)
    }

    /// Seed the in-memory delivery cache from `deliveries.jsonl` for this process's own id.
    pub fn load_delivery_cache(&mut self) -> Result<(), RuntimeError> {
        let records: Vec<DeliveryRecord> = self.deliveries_log.read_all()?;
        let seen: HashSet<String> = records
            .into_iter()
            .filter(|r| r.delivered_to == self.self_id)
            .map(|r| r.message_id)
            .collect();
        self.seen = Mutex::new(seen);
        Ok(())
    }

    /// Startup catch-up: scan the whole messages log, process every undelivered envelope for
    /// this agent in timestamp order.
    pub async fn catch_up(&self, handler: &dyn MessageHandler) -> Result<usize, RuntimeError> {
        let mut envelopes: Vec<Envelope> = self.messages_log.read_all()?;
        envelopes.sort_by_key(|e| e.timestamp);
        let mut processed = 0;
        for envelope in &envelopes {
            if self.process(envelope, handler).await? {
                processed += 1;
            }
        }
        Ok(processed)
    }

    /// One inbox-poll tick: read new lines from this agent's own inbox file since `offset`,
    /// process each, return the new offset.
    pub async fn poll_inbox(&self, offset: u64, handler: &dyn MessageHandler) -> Result<u64, RuntimeError> {
        let inbox = AppendLog::new(self.inbox_path(&self.self_id));
        let (envelopes, new_offset) = inbox.read_from::<Envelope>(offset)?;
        for envelope in &envelopes {
            self.process(envelope, handler).await?;
        }
        Ok(new_offset)
    }

    /// Read-only peek at new envelopes in this agent's own inbox since `offset`, without
    /// verifying signatures, deduping, or marking delivery. Used by synchronous tool calls
    /// waiting for a correlated reply, so they don't race the main delivery loop's at-most-once
    /// bookkeeping.
    pub fn peek_inbox(&self, offset: u64) -> Result<(Vec<Envelope>, u64), RuntimeError> {
        let inbox = AppendLog::new(self.inbox_path(&self.self_id));
        Ok(inbox.read_from::<Envelope>(offset)?)
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// One messages-log-watch tick, mirroring [`Self::poll_inbox`] but over the global log —
    /// the file-watcher optimization converges on the same handler as the poll.
    pub async fn poll_messages_log(&self, offset: u64, handler: &dyn MessageHandler) -> Result<u64, RuntimeError> {
        let (envelopes, new_offset) = self.messages_log.read_from::<Envelope>(offset)?;
        for envelope in &envelopes {
            self.process(envelope, handler).await?;
        }
        Ok(new_offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct RecordingHandler {
        count: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for RecordingHandler {
        async fn handle(&self, _envelope: &Envelope) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn send_then_poll_inbox_delivers_exactly_once() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(Registry::new(dir.path()));
        let sender = MessageBus::new("supervisor", dir.path(), registry.clone());
        sender
            .send("backend", MessageType::TaskAssign, MessageContent::Text("do it".into()), vec![])
            .await
            .unwrap();

        let mut recipient = MessageBus::new("backend", dir.path(), registry);
        recipient.load_delivery_cache().unwrap();
        let handler = RecordingHandler {
            count: AtomicUsize::new(0),
        };
        let offset = recipient.poll_inbox(0, &handler).await.unwrap();
        assert_eq!(handler.count.load(Ordering::SeqCst), 1);

        // Re-polling from the new offset does not redeliver.
        recipient.poll_inbox(offset, &handler).await.unwrap();
        assert_eq!(handler.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn at_most_once_survives_cache_reload() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(Registry::new(dir.path()));
        let sender = MessageBus::new("supervisor", dir.path(), registry.clone());
        let envelope = sender
            .send("backend", MessageType::Message, MessageContent::Text("hi".into()), vec![])
            .await
            .unwrap();

        let mut recipient = MessageBus::new("backend", dir.path(), registry.clone());
        recipient.load_delivery_cache().unwrap();
        let handler = RecordingHandler {
            count: AtomicUsize::new(0),
        };
        recipient.process(&envelope, &handler).await.unwrap();
        assert_eq!(handler.count.load(Ordering::SeqCst), 1);

        // Simulate a process restart: fresh MessageBus, cache reloaded from disk.
        let mut restarted = MessageBus::new("backend", dir.path(), registry);
        restarted.load_delivery_cache().unwrap();
        let handler2 = RecordingHandler {
            count: AtomicUsize::new(0),
        };
        let delivered_again = restarted.process(&envelope, &handler2).await.unwrap();
        assert!(!delivered_again);
        assert_eq!(handler2.count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn broadcast_delivers_once_per_recipient() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(Registry::new(dir.path()));
        let sender = MessageBus::new("supervisor", dir.path(), registry.clone());
        sender
            .send("broadcast", MessageType::StatusUpdate, MessageContent::Text("go".into()), vec![])
            .await
            .unwrap();

        let mut backend = MessageBus::new("backend", dir.path(), registry.clone());
        backend.load_delivery_cache().unwrap();
        let backend_handler = RecordingHandler {
            count: AtomicUsize::new(0),
        };
        backend.catch_up(&backend_handler).await.unwrap();
        assert_eq!(backend_handler.count.load(Ordering::SeqCst), 1);

        let mut frontend = MessageBus::new("frontend", dir.path(), registry);
        frontend.load_delivery_cache().unwrap();
        let frontend_handler = RecordingHandler {
            count: AtomicUsize::new(0),
        };
        frontend.catch_up(&frontend_handler).await.unwrap();
        assert_eq!(frontend_handler.count.load(Ordering::SeqCst), 1);

        // Re-running catch-up does not redeliver to either recipient.
        backend.catch_up(&backend_handler).await.unwrap();
        assert_eq!(backend_handler.count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn base64_round_trips() {
        let attachment = Attachment {
            filename: "payload.bin".to_string(),
            mime_type: "application/octet-stream".to_string(),
            bytes: b"hello world, this is a test payload!".to_vec(),
        };
        let json = serde_json::to_value(&attachment).unwrap();
        let decoded: Attachment = serde_json::from_value(json).unwrap();
        assert_eq!(decoded.bytes, attachment.bytes);
    }
}
