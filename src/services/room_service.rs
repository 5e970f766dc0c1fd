//! Room service: named rooms, membership, ordered message log, lifecycle.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::error::CoreError;
use crate::domain::models::{
    orchestration_room_name, Message, MessageType, Participant, ParticipantStatus, Room,
};
use crate::domain::ports::RoomRepository;

use super::event_bus::{EventBus, EventPayload};

#[derive(Debug, Clone)]
pub struct CreateRoomRequest {
    pub name: String,
    pub description: String,
    pub repository_path: String,
    pub metadata: Option<Value>,
}

pub struct RoomService {
    rooms: Arc<dyn RoomRepository>,
    bus: Arc<EventBus>,
}

impl RoomService {
    pub fn new(rooms: Arc<dyn RoomRepository>, bus: Arc<EventBus>) -> Self {
        Self { rooms, bus }
    }

    /// Create a room. Fails with `AlreadyExists` when the name is taken
    /// for this repository path.
    pub async fn create_room(&self, request: CreateRoomRequest) -> Result<Room, CoreError> {
        if self
            .rooms
            .find_by_name(&request.repository_path, &request.name)
            .await?
            .is_some()
        {
            return Err(CoreError::AlreadyExists(format!(
                "room {:?} in {}",
                request.name, request.repository_path
            )));
        }

        let mut room = Room::new(request.name, request.repository_path.clone());
        room.description = request.description;
        if let Some(metadata) = request.metadata {
            room.room_metadata = metadata;
        }
        self.rooms.insert(room.clone()).await?;

        self.bus.emit(EventPayload::RoomCreated {
            room: room.clone(),
            repository_path: request.repository_path,
        });
        Ok(room)
    }

    /// Create the coordination room for an orchestration. The derived name
    /// is unique per repository thanks to the random suffix; on the
    /// (unlikely) collision we retry with a fresh suffix.
    pub async fn create_orchestration_room(
        &self,
        repository_path: &str,
        objective: &str,
    ) -> Result<Room, CoreError> {
        for _ in 0..3 {
            let suffix = Uuid::new_v4().simple().to_string();
            let name = orchestration_room_name(objective, &suffix);
            match self
                .create_room(CreateRoomRequest {
                    name,
                    description: format!("Coordination room for: {objective}"),
                    repository_path: repository_path.to_string(),
                    metadata: None,
                })
                .await
            {
                Ok(room) => return Ok(room),
                Err(CoreError::AlreadyExists(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(CoreError::AlreadyExists(
            "could not derive a unique orchestration room name".to_string(),
        ))
    }

    /// Join an agent to a room. Idempotent: a second join emits nothing
    /// and returns false.
    pub async fn join(
        &self,
        repository_path: &str,
        room_name: &str,
        agent_name: &str,
    ) -> Result<bool, CoreError> {
        let room = self.require_room(repository_path, room_name).await?;
        let joined = self
            .rooms
            .upsert_participant(Participant {
                room_id: room.id,
                agent_name: agent_name.to_string(),
                status: ParticipantStatus::Active,
                joined_at: Utc::now(),
            })
            .await?;
        Ok(joined)
    }

    /// Append a message and emit `room_message`. Fails with `Closed` on a
    /// soft-closed room.
    pub async fn send_message(
        &self,
        repository_path: &str,
        room_name: &str,
        agent_name: &str,
        body: &str,
        message_type: MessageType,
    ) -> Result<Message, CoreError> {
        let room = self.require_room(repository_path, room_name).await?;
        if room.is_closed {
            return Err(CoreError::Closed(room_name.to_string()));
        }

        let message = Message::new(room.id, agent_name, body, message_type);
        self.rooms.append_message(message.clone()).await?;

        self.bus.emit(EventPayload::RoomMessage {
            room_name: room_name.to_string(),
            message: message.clone(),
            repository_path: repository_path.to_string(),
        });
        Ok(message)
    }

    /// Messages ascending by timestamp, ties broken by insertion id.
    pub async fn get_messages(
        &self,
        repository_path: &str,
        room_name: &str,
        limit: Option<i64>,
    ) -> Result<Vec<Message>, CoreError> {
        let room = self.require_room(repository_path, room_name).await?;
        Ok(self.rooms.list_messages(room.id, limit).await?)
    }

    /// Soft-close: the row is kept, subsequent sends fail with `Closed`.
    /// Closing an already-closed room is a no-op.
    pub async fn close_room(
        &self,
        repository_path: &str,
        room_name: &str,
        reason: Option<&str>,
    ) -> Result<(), CoreError> {
        let mut room = self.require_room(repository_path, room_name).await?;
        if room.is_closed {
            return Ok(());
        }

        if let Some(reason) = reason {
            let message = Message::new(room.id, "system", reason, MessageType::System);
            self.rooms.append_message(message).await?;
        }

        room.is_closed = true;
        self.rooms.update(room).await?;

        self.bus.emit(EventPayload::RoomClosed {
            room_name: room_name.to_string(),
            repository_path: repository_path.to_string(),
        });
        Ok(())
    }

    pub async fn list_rooms(&self, repository_path: &str) -> Result<Vec<Room>, CoreError> {
        Ok(self.rooms.list(repository_path).await?)
    }

    pub async fn get_room(
        &self,
        repository_path: &str,
        room_name: &str,
    ) -> Result<Option<Room>, CoreError> {
        Ok(self.rooms.find_by_name(repository_path, room_name).await?)
    }

    pub async fn participants(
        &self,
        repository_path: &str,
        room_name: &str,
    ) -> Result<Vec<Participant>, CoreError> {
        let room = self.require_room(repository_path, room_name).await?;
        Ok(self.rooms.list_participants(room.id).await?)
    }

    async fn require_room(
        &self,
        repository_path: &str,
        room_name: &str,
    ) -> Result<Room, CoreError> {
        self.rooms
            .find_by_name(repository_path, room_name)
            .await?
            .ok_or_else(|| CoreError::not_found("room", room_name))
    }
}
