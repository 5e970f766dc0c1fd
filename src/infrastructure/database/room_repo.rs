//! SQLite implementation of `RoomRepository`.
//!
//! Message ordering is `(timestamp, id)`; ids are time-sortable so the id
//! tie-break matches insertion order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::domain::error::DatabaseError;
use crate::domain::models::{Message, MessageType, Participant, ParticipantStatus, Room};
use crate::domain::ports::RoomRepository;

use super::row::{map_unique_violation, parse_json, parse_status, parse_ts, parse_uuid, to_rfc3339};

pub struct RoomRepositoryImpl {
    pool: SqlitePool,
}

const ROOM_COLUMNS: &str =
    "id, name, description, repository_path, room_metadata, is_closed, created_at";

impl RoomRepositoryImpl {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_room(row: &SqliteRow) -> Result<Room, DatabaseError> {
        let id: String = row.try_get("id")?;
        let metadata: String = row.try_get("room_metadata")?;
        let is_closed: i64 = row.try_get("is_closed")?;
        let created_at: String = row.try_get("created_at")?;

        Ok(Room {
            id: parse_uuid("rooms.id", &id)?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            repository_path: row.try_get("repository_path")?,
            room_metadata: parse_json("rooms.room_metadata", &metadata)?,
            is_closed: is_closed != 0,
            created_at: parse_ts("rooms.created_at", &created_at)?,
        })
    }

    fn row_to_message(row: &SqliteRow) -> Result<Message, DatabaseError> {
        let id: String = row.try_get("id")?;
        let room_id: String = row.try_get("room_id")?;
        let message_type: String = row.try_get("message_type")?;
        let timestamp: String = row.try_get("timestamp")?;

        Ok(Message {
            id: parse_uuid("messages.id", &id)?,
            room_id: parse_uuid("messages.room_id", &room_id)?,
            agent_name: row.try_get("agent_name")?,
            message: row.try_get("message")?,
            message_type: parse_status(
                "messages.message_type",
                &message_type,
                MessageType::from_str,
            )?,
            timestamp: parse_ts("messages.timestamp", &timestamp)?,
        })
    }
}

#[async_trait]
impl RoomRepository for RoomRepositoryImpl {
    async fn insert(&self, room: Room) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO rooms (id, name, description, repository_path, room_metadata, \
             is_closed, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(room.id.to_string())
        .bind(&room.name)
        .bind(&room.description)
        .bind(&room.repository_path)
        .bind(room.room_metadata.to_string())
        .bind(i64::from(room.is_closed))
        .bind(to_rfc3339(room.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, &format!("room name {:?}", room.name)))?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Room>, DatabaseError> {
        let row = sqlx::query(&format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_room).transpose()
    }

    async fn find_by_name(
        &self,
        repository_path: &str,
        name: &str,
    ) -> Result<Option<Room>, DatabaseError> {
        let row = sqlx::query(&format!(
            "SELECT {ROOM_COLUMNS} FROM rooms WHERE repository_path = ? AND name = ?"
        ))
        .bind(repository_path)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_room).transpose()
    }

    async fn update(&self, room: Room) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE rooms SET name = ?, description = ?, repository_path = ?, room_metadata = ?, \
             is_closed = ? WHERE id = ?",
        )
        .bind(&room.name)
        .bind(&room.description)
        .bind(&room.repository_path)
        .bind(room.room_metadata.to_string())
        .bind(i64::from(room.is_closed))
        .bind(room.id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM rooms WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, repository_path: &str) -> Result<Vec<Room>, DatabaseError> {
        let rows = sqlx::query(&format!(
            "SELECT {ROOM_COLUMNS} FROM rooms WHERE repository_path = ? ORDER BY created_at ASC"
        ))
        .bind(repository_path)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_room).collect()
    }

    async fn list_all(&self) -> Result<Vec<Room>, DatabaseError> {
        let rows = sqlx::query(&format!(
            "SELECT {ROOM_COLUMNS} FROM rooms ORDER BY repository_path ASC, created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_room).collect()
    }

    async fn append_message(&self, message: Message) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO messages (id, room_id, agent_name, message, message_type, timestamp) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(message.id.to_string())
        .bind(message.room_id.to_string())
        .bind(&message.agent_name)
        .bind(&message.message)
        .bind(message.message_type.as_str())
        .bind(to_rfc3339(message.timestamp))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_messages(
        &self,
        room_id: Uuid,
        limit: Option<i64>,
    ) -> Result<Vec<Message>, DatabaseError> {
        let limit = limit.unwrap_or(i64::MAX);
        // rowid is the insertion id and breaks timestamp ties in append
        // order.
        let rows = sqlx::query(
            "SELECT id, room_id, agent_name, message, message_type, timestamp FROM messages \
             WHERE room_id = ? ORDER BY timestamp ASC, rowid ASC LIMIT ?",
        )
        .bind(room_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_message).collect()
    }

    async fn last_message_at(
        &self,
        room_id: Uuid,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let row = sqlx::query(
            "SELECT timestamp FROM messages WHERE room_id = ? \
             ORDER BY timestamp DESC, rowid DESC LIMIT 1",
        )
        .bind(room_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => {
                let raw: String = r.try_get("timestamp")?;
                Ok(Some(parse_ts("messages.timestamp", &raw)?))
            }
            None => Ok(None),
        }
    }

    async fn upsert_participant(&self, participant: Participant) -> Result<bool, DatabaseError> {
        // Returns true when the row was newly inserted (a real join).
        let existed: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM room_participants WHERE room_id = ? AND agent_name = ?",
        )
        .bind(participant.room_id.to_string())
        .bind(&participant.agent_name)
        .fetch_one(&self.pool)
        .await?
        .try_get("n")?;

        sqlx::query(
            "INSERT INTO room_participants (room_id, agent_name, status, joined_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(room_id, agent_name) DO UPDATE SET status = excluded.status",
        )
        .bind(participant.room_id.to_string())
        .bind(&participant.agent_name)
        .bind(participant.status.as_str())
        .bind(to_rfc3339(participant.joined_at))
        .execute(&self.pool)
        .await?;

        Ok(existed == 0)
    }

    async fn list_participants(&self, room_id: Uuid) -> Result<Vec<Participant>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT room_id, agent_name, status, joined_at FROM room_participants \
             WHERE room_id = ? ORDER BY joined_at ASC",
        )
        .bind(room_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let room_id: String = row.try_get("room_id")?;
                let status: String = row.try_get("status")?;
                let joined_at: String = row.try_get("joined_at")?;
                Ok(Participant {
                    room_id: parse_uuid("room_participants.room_id", &room_id)?,
                    agent_name: row.try_get("agent_name")?,
                    status: parse_status(
                        "room_participants.status",
                        &status,
                        ParticipantStatus::from_str,
                    )?,
                    joined_at: parse_ts("room_participants.joined_at", &joined_at)?,
                })
            })
            .collect()
    }
}
