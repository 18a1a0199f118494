pub mod broadcaster;
pub mod registry;

pub use broadcaster::{Broadcaster, PublishReport};
pub use registry::{ConnectionId, ConnectionRegistry, RegistryError, SendOutcome};
