use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::queue::{order_queue, QueueEntry, Track};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Principal {
    pub user_id: String,
}

impl Principal {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomAction {
    ControlPlayback,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("credential is not recognized")]
    UnknownCredential,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("room {0} does not exist")]
    UnknownRoom(String),
    #[error("track {track_id} is not queued in room {room_id}")]
    UnknownTrack { room_id: String, track_id: String },
    #[error("room directory is unavailable")]
    Unavailable,
}

pub trait Authenticator: Send + Sync {
    fn authenticate(&self, credential: &str) -> Result<Principal, AuthError>;
    fn authorize(&self, principal: &Principal, room_id: &str, action: RoomAction) -> bool;
}

pub trait RoomDirectory: Send + Sync {
    fn room_exists(&self, room_id: &str) -> bool;
    fn get_queue(&self, room_id: &str) -> Result<Vec<QueueEntry>, DirectoryError>;
    fn administrator_of(&self, room_id: &str) -> Result<Principal, DirectoryError>;
    fn member_joined(&self, room_id: &str, principal: &Principal);
    fn member_left(&self, room_id: &str, principal: &Principal);

    fn find_track(&self, room_id: &str, track_id: &str) -> Result<Track, DirectoryError> {
        self.get_queue(room_id)?
            .into_iter()
            .map(|entry| entry.track)
            .find(|track| track.id == track_id)
            .ok_or_else(|| DirectoryError::UnknownTrack {
                room_id: room_id.to_string(),
                track_id: track_id.to_string(),
            })
    }
}

#[derive(Debug, Default)]
struct StoredRoom {
    administrator: Option<Principal>,
    entries: Vec<QueueEntry>,
    members: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    rooms: RwLock<HashMap<String, StoredRoom>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_room(&self, room_id: &str, administrator: Principal) {
        let Ok(mut rooms) = self.rooms.write() else {
            return;
        };
        rooms.entry(room_id.to_string()).or_default().administrator = Some(administrator);
    }

    pub fn add_track(&self, room_id: &str, track: Track, uploaded_at: i64) -> Result<(), DirectoryError> {
        let mut rooms = self.rooms.write().map_err(|_| DirectoryError::Unavailable)?;
        let room = rooms
            .get_mut(room_id)
            .ok_or_else(|| DirectoryError::UnknownRoom(room_id.to_string()))?;
        room.entries.retain(|entry| entry.track.id != track.id);
        room.entries.push(QueueEntry {
            track,
            vote_score: 0,
            uploaded_at,
        });
        Ok(())
    }

    pub fn remove_track(&self, room_id: &str, track_id: &str) -> Result<bool, DirectoryError> {
        let mut rooms = self.rooms.write().map_err(|_| DirectoryError::Unavailable)?;
        let room = rooms
            .get_mut(room_id)
            .ok_or_else(|| DirectoryError::UnknownRoom(room_id.to_string()))?;
        let before = room.entries.len();
        room.entries.retain(|entry| entry.track.id != track_id);
        Ok(room.entries.len() != before)
    }

    pub fn vote(&self, room_id: &str, track_id: &str, delta: i32) -> Result<u32, DirectoryError> {
        let mut rooms = self.rooms.write().map_err(|_| DirectoryError::Unavailable)?;
        let room = rooms
            .get_mut(room_id)
            .ok_or_else(|| DirectoryError::UnknownRoom(room_id.to_string()))?;
        let entry = room
            .entries
            .iter_mut()
            .find(|entry| entry.track.id == track_id)
            .ok_or_else(|| DirectoryError::UnknownTrack {
                room_id: room_id.to_string(),
                track_id: track_id.to_string(),
            })?;
        entry.vote_score = entry.vote_score.saturating_add_signed(delta);
        Ok(entry.vote_score)
    }

    pub fn members(&self, room_id: &str) -> Vec<String> {
        let Ok(rooms) = self.rooms.read() else {
            return Vec::new();
        };
        let mut members = rooms
            .get(room_id)
            .map(|room| room.members.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        members.sort();
        members
    }
}

impl RoomDirectory for InMemoryDirectory {
    fn room_exists(&self, room_id: &str) -> bool {
        self.rooms
            .read()
            .map(|rooms| rooms.contains_key(room_id))
            .unwrap_or(false)
    }

    fn get_queue(&self, room_id: &str) -> Result<Vec<QueueEntry>, DirectoryError> {
        let rooms = self.rooms.read().map_err(|_| DirectoryError::Unavailable)?;
        let room = rooms
            .get(room_id)
            .ok_or_else(|| DirectoryError::UnknownRoom(room_id.to_string()))?;
        Ok(order_queue(room.entries.clone()))
    }

    fn administrator_of(&self, room_id: &str) -> Result<Principal, DirectoryError> {
        let rooms = self.rooms.read().map_err(|_| DirectoryError::Unavailable)?;
        rooms
            .get(room_id)
            .and_then(|room| room.administrator.clone())
            .ok_or_else(|| DirectoryError::UnknownRoom(room_id.to_string()))
    }

    fn member_joined(&self, room_id: &str, principal: &Principal) {
        if let Ok(mut rooms) = self.rooms.write() {
            if let Some(room) = rooms.get_mut(room_id) {
                room.members.insert(principal.user_id.clone());
            }
        }
    }

    fn member_left(&self, room_id: &str, principal: &Principal) {
        if let Ok(mut rooms) = self.rooms.write() {
            if let Some(room) = rooms.get_mut(room_id) {
                room.members.remove(&principal.user_id);
            }
        }
    }
}

pub struct StaticAuthenticator {
    credentials: HashMap<String, Principal>,
    directory: Arc<dyn RoomDirectory>,
}

impl StaticAuthenticator {
    pub fn new(credentials: HashMap<String, Principal>, directory: Arc<dyn RoomDirectory>) -> Self {
        Self {
            credentials,
            directory,
        }
    }
}

impl Authenticator for StaticAuthenticator {
    fn authenticate(&self, credential: &str) -> Result<Principal, AuthError> {
        self.credentials
            .get(credential)
            .cloned()
            .ok_or(AuthError::UnknownCredential)
    }

    fn authorize(&self, principal: &Principal, room_id: &str, action: RoomAction) -> bool {
        match action {
            RoomAction::ControlPlayback => self
                .directory
                .administrator_of(room_id)
                .map(|admin| &admin == principal)
                .unwrap_or(false),
        }
    }
}
