//! Multi-turn conversation storage.
//!
//! Key layout:
//!
//! ```text
//! conversation:{id}              hash (metadata, 24h sliding)
//! conversation:{id}:messages     list (capped, trimmed tail-last)
//! conversations:index            set of conversation ids
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::observability::LogEvent;
use crate::providers::{ChatMessage, Role};
use crate::store::RedisHandle;

const CONVERSATION_PREFIX: &str = "conversation:";
const INDEX_KEY: &str = "conversations:index";

/// Default bound on stored messages per conversation.
pub const DEFAULT_MAX_MESSAGES: u64 = 100;
/// Default number of history messages assembled into a prompt context.
pub const DEFAULT_CONTEXT_LIMIT: u64 = 20;

/// Conversation metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// Unique id, `conv_` + 12 hex chars.
    pub conversation_id: String,
    /// Default model for turns submitted into this conversation.
    pub model: Option<String>,
    /// System prompt; mirrored as the first stored message.
    pub system_prompt: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
    /// Messages appended so far.
    pub message_count: u64,
    /// Caller-attached metadata.
    pub metadata: Option<Value>,
}

/// Mutable metadata fields accepted by [`ConversationStore::update_conversation`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConversationPatch {
    /// New default model.
    pub model: Option<String>,
    /// New system prompt (does not rewrite stored messages).
    pub system_prompt: Option<String>,
    /// Replacement metadata.
    pub metadata: Option<Value>,
}

/// Redis-backed storage for bounded multi-turn histories.
pub struct ConversationStore {
    handle: Arc<RedisHandle>,
    ttl_secs: u64,
    max_messages: u64,
    context_limit: u64,
}

impl ConversationStore {
    /// Build a store over a shared connection handle.
    pub fn new(handle: Arc<RedisHandle>, ttl_secs: u64) -> Self {
        Self {
            handle,
            ttl_secs,
            max_messages: DEFAULT_MAX_MESSAGES,
            context_limit: DEFAULT_CONTEXT_LIMIT,
        }
    }

    fn conv_key(conversation_id: &str) -> String {
        format!("{CONVERSATION_PREFIX}{conversation_id}")
    }

    fn messages_key(conversation_id: &str) -> String {
        format!("{CONVERSATION_PREFIX}{conversation_id}:messages")
    }

    /// Create a conversation; a system prompt is appended as the first
    /// message in the same atomic pipeline.
    pub async fn create_conversation(
        &self,
        model: Option<String>,
        system_prompt: Option<String>,
        metadata: Option<Value>,
    ) -> Result<Conversation> {
        let conversation_id = format!("conv_{}", &Uuid::new_v4().simple().to_string()[..12]);
        let conv_key = Self::conv_key(&conversation_id);
        let messages_key = Self::messages_key(&conversation_id);
        let now = Utc::now();

        let mut fields: Vec<(String, String)> = vec![
            ("conversation_id".to_string(), conversation_id.clone()),
            ("created_at".to_string(), now.to_rfc3339()),
            ("updated_at".to_string(), now.to_rfc3339()),
        ];
        let mut message_count = 0u64;
        if let Some(model) = &model {
            fields.push(("model".to_string(), model.clone()));
        }
        if let Some(system_prompt) = &system_prompt {
            fields.push(("system_prompt".to_string(), system_prompt.clone()));
            message_count = 1;
        }
        if let Some(metadata) = &metadata {
            fields.push(("metadata".to_string(), metadata.to_string()));
        }
        fields.push(("message_count".to_string(), message_count.to_string()));

        let system_message = system_prompt
            .as_ref()
            .map(|prompt| {
                let message = ChatMessage {
                    role: Role::System,
                    content: prompt.clone(),
                    timestamp: Some(now),
                };
                serde_json::to_string(&message).map_err(|err| {
                    Error::InfrastructureUnavailable(format!(
                        "cannot encode system message: {err}"
                    ))
                })
            })
            .transpose()?;
        let ttl = self.ttl_secs;

        self.handle
            .run_pipeline::<(), _>("create_conversation", || {
                let mut pipe = ::redis::pipe();
                pipe.atomic();
                let cmd = pipe.cmd("HSET");
                cmd.arg(&conv_key);
                for (field, value) in &fields {
                    cmd.arg(field).arg(value);
                }
                cmd.ignore();
                pipe.cmd("EXPIRE").arg(&conv_key).arg(ttl).ignore();
                pipe.cmd("SADD").arg(INDEX_KEY).arg(&conversation_id).ignore();
                if let Some(message) = &system_message {
                    pipe.cmd("RPUSH").arg(&messages_key).arg(message).ignore();
                    pipe.cmd("EXPIRE").arg(&messages_key).arg(ttl).ignore();
                }
                pipe
            })
            .await?;

        tracing::info!(
            event = LogEvent::ConversationCreated.as_str(),
            conversation_id = %conversation_id,
            model = ?model,
            has_system_prompt = system_prompt.is_some(),
            "conversation created"
        );

        Ok(Conversation {
            conversation_id,
            model,
            system_prompt,
            created_at: now,
            updated_at: now,
            message_count,
            metadata,
        })
    }

    /// Load conversation metadata; `None` when absent or expired.
    pub async fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        let key = Self::conv_key(conversation_id);
        let map: HashMap<String, String> = self
            .handle
            .run_command("get_conversation", || {
                let mut cmd = ::redis::cmd("HGETALL");
                cmd.arg(&key);
                cmd
            })
            .await?;
        if map.is_empty() {
            return Ok(None);
        }
        Ok(Some(Conversation {
            conversation_id: map
                .get("conversation_id")
                .cloned()
                .unwrap_or_else(|| conversation_id.to_string()),
            model: map.get("model").cloned(),
            system_prompt: map.get("system_prompt").cloned(),
            created_at: parse_timestamp(&map, "created_at"),
            updated_at: parse_timestamp(&map, "updated_at"),
            message_count: map
                .get("message_count")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            metadata: map
                .get("metadata")
                .and_then(|raw| serde_json::from_str(raw).ok()),
        }))
    }

    /// Patch conversation metadata; refreshes the TTL.
    pub async fn update_conversation(
        &self,
        conversation_id: &str,
        patch: &ConversationPatch,
    ) -> Result<Option<Conversation>> {
        if self.get_conversation(conversation_id).await?.is_none() {
            return Ok(None);
        }
        let key = Self::conv_key(conversation_id);
        let mut fields = vec![("updated_at".to_string(), Utc::now().to_rfc3339())];
        if let Some(model) = &patch.model {
            fields.push(("model".to_string(), model.clone()));
        }
        if let Some(system_prompt) = &patch.system_prompt {
            fields.push(("system_prompt".to_string(), system_prompt.clone()));
        }
        if let Some(metadata) = &patch.metadata {
            fields.push(("metadata".to_string(), metadata.to_string()));
        }
        let ttl = self.ttl_secs;

        self.handle
            .run_pipeline::<(), _>("update_conversation", || {
                let mut pipe = ::redis::pipe();
                pipe.atomic();
                let cmd = pipe.cmd("HSET");
                cmd.arg(&key);
                for (field, value) in &fields {
                    cmd.arg(field).arg(value);
                }
                cmd.ignore();
                pipe.cmd("EXPIRE").arg(&key).arg(ttl).ignore();
                pipe
            })
            .await?;

        tracing::debug!(
            event = LogEvent::ConversationUpdated.as_str(),
            conversation_id,
            "conversation updated"
        );
        self.get_conversation(conversation_id).await
    }

    /// Delete a conversation, its messages and its index entry. Returns
    /// whether it existed.
    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<bool> {
        if self.get_conversation(conversation_id).await?.is_none() {
            return Ok(false);
        }
        let conv_key = Self::conv_key(conversation_id);
        let messages_key = Self::messages_key(conversation_id);
        let id = conversation_id.to_string();
        self.handle
            .run_pipeline::<(), _>("delete_conversation", || {
                let mut pipe = ::redis::pipe();
                pipe.atomic();
                pipe.cmd("DEL").arg(&conv_key).arg(&messages_key).ignore();
                pipe.cmd("SREM").arg(INDEX_KEY).arg(&id).ignore();
                pipe
            })
            .await?;
        tracing::info!(
            event = LogEvent::ConversationDeleted.as_str(),
            conversation_id,
            "conversation deleted"
        );
        Ok(true)
    }

    /// Append one message; bumps the counter, trims to the cap (oldest out)
    /// and refreshes both TTLs. Returns `false` when the conversation does
    /// not exist.
    pub async fn add_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
    ) -> Result<bool> {
        if self.get_conversation(conversation_id).await?.is_none() {
            tracing::warn!(conversation_id, "conversation not found for message append");
            return Ok(false);
        }
        let conv_key = Self::conv_key(conversation_id);
        let messages_key = Self::messages_key(conversation_id);
        let now = Utc::now();
        let message = ChatMessage {
            role,
            content: content.to_string(),
            timestamp: Some(now),
        };
        let encoded = serde_json::to_string(&message).map_err(|err| {
            Error::InfrastructureUnavailable(format!("cannot encode chat message: {err}"))
        })?;
        let cap = self.max_messages as i64;
        let ttl = self.ttl_secs;
        let updated_at = now.to_rfc3339();

        self.handle
            .run_pipeline::<(), _>("add_message", || {
                let mut pipe = ::redis::pipe();
                pipe.atomic();
                pipe.cmd("RPUSH").arg(&messages_key).arg(&encoded).ignore();
                pipe.cmd("LTRIM").arg(&messages_key).arg(-cap).arg(-1).ignore();
                pipe.cmd("HINCRBY")
                    .arg(&conv_key)
                    .arg("message_count")
                    .arg(1)
                    .ignore();
                pipe.cmd("HSET")
                    .arg(&conv_key)
                    .arg("updated_at")
                    .arg(&updated_at)
                    .ignore();
                pipe.cmd("EXPIRE").arg(&conv_key).arg(ttl).ignore();
                pipe.cmd("EXPIRE").arg(&messages_key).arg(ttl).ignore();
                pipe
            })
            .await?;

        tracing::debug!(
            event = LogEvent::ConversationMessageAppended.as_str(),
            conversation_id,
            role = ?role,
            "conversation message appended"
        );
        Ok(true)
    }

    /// Stored messages, oldest first; `limit` takes the newest N.
    pub async fn get_messages(
        &self,
        conversation_id: &str,
        limit: Option<u64>,
    ) -> Result<Vec<ChatMessage>> {
        let key = Self::messages_key(conversation_id);
        let start = match limit {
            Some(limit) => -(limit.max(1) as i64),
            None => 0,
        };
        let payloads: Vec<String> = self
            .handle
            .run_command("get_messages", || {
                let mut cmd = ::redis::cmd("LRANGE");
                cmd.arg(&key).arg(start).arg(-1);
                cmd
            })
            .await?;
        let mut out = Vec::with_capacity(payloads.len());
        for payload in payloads {
            match serde_json::from_str::<ChatMessage>(&payload) {
                Ok(message) => out.push(message),
                Err(err) => {
                    tracing::warn!(
                        conversation_id,
                        error = %err,
                        "invalid chat message payload in conversation store"
                    );
                }
            }
        }
        Ok(out)
    }

    /// Clear the message list (metadata survives). Returns whether the
    /// conversation existed.
    pub async fn clear_messages(&self, conversation_id: &str) -> Result<bool> {
        if self.get_conversation(conversation_id).await?.is_none() {
            return Ok(false);
        }
        let conv_key = Self::conv_key(conversation_id);
        let messages_key = Self::messages_key(conversation_id);
        self.handle
            .run_pipeline::<(), _>("clear_messages", || {
                let mut pipe = ::redis::pipe();
                pipe.atomic();
                pipe.cmd("DEL").arg(&messages_key).ignore();
                pipe.cmd("HSET")
                    .arg(&conv_key)
                    .arg("message_count")
                    .arg(0)
                    .ignore();
                pipe
            })
            .await?;
        Ok(true)
    }

    /// History window assembled into generation context: the newest
    /// `context_limit` messages.
    pub async fn get_context_messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>> {
        self.get_messages(conversation_id, Some(self.context_limit))
            .await
    }

    /// All known conversation ids.
    pub async fn list_conversations(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .handle
            .run_command("list_conversations", || {
                let mut cmd = ::redis::cmd("SMEMBERS");
                cmd.arg(INDEX_KEY);
                cmd
            })
            .await?;
        ids.sort();
        Ok(ids)
    }
}

fn parse_timestamp(map: &HashMap<String, String>, field: &str) -> DateTime<Utc> {
    map.get(field)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}
