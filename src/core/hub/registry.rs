use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::events::ServerMessage;
use crate::core::room::directory::{Principal, RoomDirectory};

pub type ConnectionId = Uuid;
pub type Outbound = mpsc::Sender<ServerMessage>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),
    #[error("connection {0} has not authenticated")]
    NotAuthenticated(ConnectionId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    Dropped,
}

struct Subscriber {
    outbound: Outbound,
    principal: Option<Principal>,
    room_id: Option<String>,
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<ConnectionId, Subscriber>,
    rooms: HashMap<String, HashSet<ConnectionId>>,
}

impl RegistryInner {
    fn detach(&mut self, id: ConnectionId) -> Option<(String, Option<Principal>)> {
        let subscriber = self.connections.get_mut(&id)?;
        let room_id = subscriber.room_id.take()?;
        let principal = subscriber.principal.clone();
        if let Some(members) = self.rooms.get_mut(&room_id) {
            members.remove(&id);
            if members.is_empty() {
                self.rooms.remove(&room_id);
            }
        }
        Some((room_id, principal))
    }

    fn user_still_in_room(&self, room_id: &str, principal: &Principal) -> bool {
        self.rooms.get(room_id).is_some_and(|members| {
            members.iter().any(|id| {
                self.connections
                    .get(id)
                    .and_then(|subscriber| subscriber.principal.as_ref())
                    == Some(principal)
            })
        })
    }

    fn departed(&self, detached: Option<(String, Option<Principal>)>) -> Option<(String, Principal)> {
        let (room_id, principal) = detached?;
        let principal = principal?;
        if self.user_still_in_room(&room_id, &principal) {
            None
        } else {
            Some((room_id, principal))
        }
    }
}

pub struct ConnectionRegistry {
    inner: Mutex<RegistryInner>,
    directory: Arc<dyn RoomDirectory>,
}

impl ConnectionRegistry {
    pub fn new(directory: Arc<dyn RoomDirectory>) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            directory,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, outbound: Outbound) -> ConnectionId {
        let id = Uuid::new_v4();
        self.lock().connections.insert(
            id,
            Subscriber {
                outbound,
                principal: None,
                room_id: None,
            },
        );
        id
    }

    pub fn authenticate(&self, id: ConnectionId, principal: Principal) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        let subscriber = inner
            .connections
            .get_mut(&id)
            .ok_or(RegistryError::UnknownConnection(id))?;
        subscriber.principal = Some(principal);
        Ok(())
    }

    pub fn principal_of(&self, id: ConnectionId) -> Option<Principal> {
        self.lock()
            .connections
            .get(&id)
            .and_then(|subscriber| subscriber.principal.clone())
    }

    pub fn room_of(&self, id: ConnectionId) -> Option<String> {
        self.lock()
            .connections
            .get(&id)
            .and_then(|subscriber| subscriber.room_id.clone())
    }

    /// Moves the connection into `room_id`. The previous membership is dropped under the
    /// same lock, so the connection is never subscribed to two rooms at once.
    pub fn join(&self, id: ConnectionId, room_id: &str) -> Result<Option<String>, RegistryError> {
        let (previous, departed, principal) = {
            let mut inner = self.lock();
            let principal = {
                let subscriber = inner
                    .connections
                    .get(&id)
                    .ok_or(RegistryError::UnknownConnection(id))?;
                subscriber
                    .principal
                    .clone()
                    .ok_or(RegistryError::NotAuthenticated(id))?
            };

            let detached = inner.detach(id);
            let previous = detached.as_ref().map(|(room, _)| room.clone());
            let departed = inner.departed(detached);

            if let Some(subscriber) = inner.connections.get_mut(&id) {
                subscriber.room_id = Some(room_id.to_string());
            }
            inner.rooms.entry(room_id.to_string()).or_default().insert(id);
            (previous, departed, principal)
        };

        if let Some((room, user)) = departed {
            self.directory.member_left(&room, &user);
        }
        self.directory.member_joined(room_id, &principal);
        Ok(previous)
    }

    pub fn leave(&self, id: ConnectionId) -> Option<String> {
        let (previous, departed) = {
            let mut inner = self.lock();
            let detached = inner.detach(id);
            let previous = detached.as_ref().map(|(room, _)| room.clone());
            (previous, inner.departed(detached))
        };
        if let Some((room, user)) = departed {
            self.directory.member_left(&room, &user);
        }
        previous
    }

    pub fn remove(&self, id: ConnectionId) -> bool {
        let (existed, departed) = {
            let mut inner = self.lock();
            let detached = inner.detach(id);
            let departed = inner.departed(detached);
            (inner.connections.remove(&id).is_some(), departed)
        };
        if let Some((room, user)) = departed {
            log::info!("{} left room {room}", user.user_id);
            self.directory.member_left(&room, &user);
        }
        existed
    }

    pub fn subscribers(&self, room_id: &str) -> Vec<(ConnectionId, Outbound)> {
        let inner = self.lock();
        inner
            .rooms
            .get(room_id)
            .map(|members| {
                members
                    .iter()
                    .filter_map(|id| {
                        inner
                            .connections
                            .get(id)
                            .map(|subscriber| (*id, subscriber.outbound.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, room_id: &str) -> usize {
        self.lock().rooms.get(room_id).map(HashSet::len).unwrap_or(0)
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// Non-blocking send. A full or closed queue counts as a disconnect.
    pub fn send_to(&self, id: ConnectionId, message: ServerMessage) -> SendOutcome {
        let outbound = self
            .lock()
            .connections
            .get(&id)
            .map(|subscriber| subscriber.outbound.clone());
        let Some(outbound) = outbound else {
            return SendOutcome::Dropped;
        };
        match outbound.try_send(message) {
            Ok(()) => SendOutcome::Delivered,
            Err(err) => {
                log::warn!("dropping connection {id}: {err}");
                self.remove(id);
                SendOutcome::Dropped
            }
        }
    }
}
