pub mod engine;
pub mod registry;
pub mod rounds;
pub mod snapshot;
pub mod timers;
pub mod types;
pub mod vrf_engine;

pub use engine::{EngineParts, EntryVerifier, GameEngine, GameSettlement, JoinRequest};
pub use registry::GameRegistry;
pub use types::*;
pub use vrf_engine::{RandomnessSource, VRFGameEngine};
