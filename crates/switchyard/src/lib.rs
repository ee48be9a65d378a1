pub mod agents;
pub mod config;
pub mod generation;
pub mod message;
pub mod model;
pub mod prompt_template;
pub mod providers;
pub mod router;
pub mod testing;
pub mod tools;
pub mod utils;

pub use agents::{Gateway, TurnEvent, TurnRequest};
