pub mod config;
pub mod dispatch;
pub mod heal;
pub mod init;
pub mod memory;
pub mod project;
pub mod review;
pub mod task;
pub mod verify;

use qralph_core::engine::PhaseEngine;
use qralph_core::{QralphError, Result};
use std::path::PathBuf;

/// Root and project, resolved once at the entry point.
pub struct Ctx {
    pub root: PathBuf,
    pub project: Option<String>,
}

impl Ctx {
    pub fn project(&self) -> Result<&str> {
        self.project.as_deref().ok_or(QralphError::NoProject)
    }

    pub fn engine(&self) -> Result<PhaseEngine> {
        PhaseEngine::open(&self.root)
    }
}
