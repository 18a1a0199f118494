pub mod commands;
pub mod directory;
pub mod queue;
pub mod state;

pub use commands::{CommandError, CommandHandler};
pub use directory::{
    AuthError, Authenticator, DirectoryError, InMemoryDirectory, Principal, RoomAction,
    RoomDirectory, StaticAuthenticator,
};
pub use queue::{order_queue, QueueEntry, Track};
pub use state::{InvalidTransition, PlaybackPhase, RoomPlaybackState, RoomSnapshot};
