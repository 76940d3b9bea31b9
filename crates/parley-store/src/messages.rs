//! Message persistence. Rows are immutable once written except for the
//! enrichment columns, which are filled in after the fact.

use chrono::Utc;
use tracing::instrument;

use parley_core::ids::{ChatId, MessageId};
use parley_core::protocol::{Attachment, Enrichment, Sentiment, WireMessage};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist a message (and its attachment row, if any) in one
    /// transaction. A failure part-way through leaves nothing behind.
    #[instrument(skip(self, body, attachment), fields(chat_id = %chat_id))]
    pub fn append(
        &self,
        chat_id: &ChatId,
        sender: &str,
        receiver: &str,
        body: &str,
        attachment: Option<&Attachment>,
    ) -> Result<WireMessage, StoreError> {
        let id = MessageId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO messages (id, chat_id, sender, receiver, body, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![id.as_str(), chat_id.as_str(), sender, receiver, body, now],
            )?;

            if let Some(att) = attachment {
                tx.execute(
                    "INSERT INTO attachments (message_id, file_name, file_type, data)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![id.as_str(), att.file_name, att.file_type, att.data],
                )?;
            }

            Ok(WireMessage {
                message_id: id.clone(),
                chat_id: chat_id.clone(),
                sender: sender.to_string(),
                receiver: receiver.to_string(),
                body: body.to_string(),
                attachment: attachment.cloned(),
                timestamp: now.clone(),
                enrichment: None,
            })
        })
    }

    /// All messages for a chat, ordered by timestamp ascending.
    #[instrument(skip(self), fields(chat_id = %chat_id))]
    pub fn list_for_chat(&self, chat_id: &ChatId) -> Result<Vec<WireMessage>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.chat_id, m.sender, m.receiver, m.body, m.timestamp,
                        m.sentiment_label, m.sentiment_confidence, m.language,
                        a.file_name, a.file_type, a.data
                 FROM messages m
                 LEFT JOIN attachments a ON a.message_id = m.id
                 WHERE m.chat_id = ?1
                 ORDER BY m.timestamp ASC, m.id ASC",
            )?;
            let mut rows = stmt.query([chat_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            Ok(results)
        })
    }

    /// The most recent `limit` messages for a chat, in chronological order.
    #[instrument(skip(self), fields(chat_id = %chat_id, limit))]
    pub fn recent(&self, chat_id: &ChatId, limit: u32) -> Result<Vec<WireMessage>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.chat_id, m.sender, m.receiver, m.body, m.timestamp,
                        m.sentiment_label, m.sentiment_confidence, m.language,
                        a.file_name, a.file_type, a.data
                 FROM messages m
                 LEFT JOIN attachments a ON a.message_id = m.id
                 WHERE m.chat_id = ?1
                 ORDER BY m.timestamp DESC, m.id DESC
                 LIMIT ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![chat_id.as_str(), limit])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            results.reverse();
            Ok(results)
        })
    }

    /// Attach enrichment to an already-persisted message.
    #[instrument(skip(self, enrichment), fields(message_id = %message_id))]
    pub fn set_enrichment(
        &self,
        message_id: &MessageId,
        enrichment: &Enrichment,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE messages SET sentiment_label = ?1, sentiment_confidence = ?2, language = ?3
                 WHERE id = ?4",
                rusqlite::params![
                    enrichment.sentiment.label,
                    enrichment.sentiment.confidence,
                    enrichment.language,
                    message_id.as_str(),
                ],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("message {message_id}")));
            }
            Ok(())
        })
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<WireMessage, StoreError> {
    let label: Option<String> = row_helpers::get_opt(row, 6, "messages", "sentiment_label")?;
    let confidence: Option<f64> = row_helpers::get_opt(row, 7, "messages", "sentiment_confidence")?;
    let language: Option<String> = row_helpers::get_opt(row, 8, "messages", "language")?;

    let enrichment = match (label, language) {
        (Some(label), Some(language)) => Some(Enrichment {
            sentiment: Sentiment {
                label,
                confidence: confidence.unwrap_or(0.5),
            },
            language,
        }),
        _ => None,
    };

    let file_name: Option<String> = row_helpers::get_opt(row, 9, "attachments", "file_name")?;
    let attachment = match file_name {
        Some(file_name) => Some(Attachment {
            file_name,
            file_type: row_helpers::get(row, 10, "attachments", "file_type")?,
            data: row_helpers::get(row, 11, "attachments", "data")?,
        }),
        None => None,
    };

    Ok(WireMessage {
        message_id: MessageId::from_raw(row_helpers::get::<String>(row, 0, "messages", "id")?),
        chat_id: ChatId::from_raw(row_helpers::get::<String>(row, 1, "messages", "chat_id")?),
        sender: row_helpers::get(row, 2, "messages", "sender")?,
        receiver: row_helpers::get(row, 3, "messages", "receiver")?,
        body: row_helpers::get(row, 4, "messages", "body")?,
        attachment,
        timestamp: row_helpers::get(row, 5, "messages", "timestamp")?,
        enrichment,
    })
}
