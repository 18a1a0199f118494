pub mod clock;
pub mod config;
pub mod events;
pub mod hub;
pub mod room;
pub mod server;
pub mod sync;

use std::sync::Arc;

use clock::{Clock, SystemClock};
use config::{RoomSeed, ServerConfig};
use hub::{Broadcaster, ConnectionRegistry};
use room::{
    Authenticator, CommandHandler, DirectoryError, InMemoryDirectory, Principal, RoomDirectory,
    StaticAuthenticator,
};

pub struct ServerCore {
    config: ServerConfig,
    clock: Arc<dyn Clock>,
    directory: Arc<dyn RoomDirectory>,
    authenticator: Arc<dyn Authenticator>,
    registry: Arc<ConnectionRegistry>,
    commands: CommandHandler,
}

impl ServerCore {
    pub fn new(config: ServerConfig) -> Result<Self, DirectoryError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: ServerConfig, clock: Arc<dyn Clock>) -> Result<Self, DirectoryError> {
        let directory = Arc::new(InMemoryDirectory::new());
        seed_directory(&directory, &config.rooms, clock.now_ms())?;
        let directory: Arc<dyn RoomDirectory> = directory;
        let authenticator = Arc::new(StaticAuthenticator::new(
            config.credential_table(),
            Arc::clone(&directory),
        ));
        Ok(Self::with_collaborators(config, clock, directory, authenticator))
    }

    pub fn with_collaborators(
        config: ServerConfig,
        clock: Arc<dyn Clock>,
        directory: Arc<dyn RoomDirectory>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(Arc::clone(&directory)));
        let broadcaster = Broadcaster::new(Arc::clone(&registry));
        let commands = CommandHandler::new(
            Arc::clone(&directory),
            Arc::clone(&authenticator),
            broadcaster,
            Arc::clone(&clock),
            config.auto_advance,
        );
        Self {
            config,
            clock,
            directory,
            authenticator,
            registry,
            commands,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn directory(&self) -> &Arc<dyn RoomDirectory> {
        &self.directory
    }

    pub fn authenticator(&self) -> &Arc<dyn Authenticator> {
        &self.authenticator
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn commands(&self) -> &CommandHandler {
        &self.commands
    }
}

pub fn seed_directory(
    directory: &InMemoryDirectory,
    rooms: &[RoomSeed],
    now_ms: i64,
) -> Result<(), DirectoryError> {
    for seed in rooms {
        directory.create_room(&seed.room_id, Principal::new(seed.administrator.clone()));
        for (index, track) in seed.tracks.iter().enumerate() {
            directory.add_track(&seed.room_id, track.clone(), now_ms + index as i64)?;
        }
        log::info!(
            "room {} ready with {} tracks (administrator {})",
            seed.room_id,
            seed.tracks.len(),
            seed.administrator
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::room::Track;

    #[test]
    fn seeded_rooms_keep_track_order() {
        let config = ServerConfig {
            rooms: vec![RoomSeed {
                room_id: "party".to_string(),
                administrator: "dj".to_string(),
                tracks: vec![
                    Track {
                        id: "first".to_string(),
                        title: "First".to_string(),
                        duration_ms: 1_000,
                    },
                    Track {
                        id: "second".to_string(),
                        title: "Second".to_string(),
                        duration_ms: 1_000,
                    },
                ],
            }],
            ..ServerConfig::default()
        };
        let core = ServerCore::with_clock(config, Arc::new(ManualClock::new(500)))
            .expect("seed directory");

        let queue = core.directory().get_queue("party").expect("room exists");
        let ids = queue.iter().map(|entry| entry.track.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["first", "second"]);
        assert_eq!(
            core.directory().administrator_of("party"),
            Ok(Principal::new("dj"))
        );
        assert!(!core.directory().room_exists("lobby"));
    }
}
