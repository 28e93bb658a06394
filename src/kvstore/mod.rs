//! Replicated itinerary key-value store: record model, client operation
//! parsing, and the state machine that applies learned Paxos values.

mod command;
mod itinerary;
mod statemach;

pub use command::{KvCommand, KvOperation, PaxosValue};
pub use itinerary::Itinerary;
pub use statemach::KeyValueStore;
