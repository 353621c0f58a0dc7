pub mod artifact;
pub mod checkpoint;
pub mod config;
pub mod controller;
pub mod errors;
pub mod events;
pub mod invoker;
pub mod logging;
pub mod planner;
pub mod scheduler;
pub mod state;

pub use config::{ConductorConfig, EngineConfig};
pub use controller::RunController;
pub use errors::{EngineError, EngineResult};
pub use invoker::WorkerRegistry;
pub use state::RunSnapshot;
