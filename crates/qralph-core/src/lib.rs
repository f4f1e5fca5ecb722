pub mod audit;
pub mod config;
pub mod control;
pub mod deferred;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod healing;
pub mod io;
pub mod lock;
pub mod memory;
pub mod paths;
pub mod process;
pub mod state;
pub mod store;
pub mod synthesis;
pub mod team;
pub mod types;
pub mod verify;
pub mod workspace;

pub use error::{QralphError, Result};
