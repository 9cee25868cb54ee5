pub mod api;
pub mod config;
pub mod db;
pub mod engine;
pub mod git;
pub mod runtime;
pub mod startup;

#[cfg(test)]
pub(crate) mod testing;

pub use db::DbPool;

use config::Config;
use std::sync::Arc;

use crate::db::SessionStore;
use crate::engine::AppManager;

pub struct AppState {
    pub config: Config,
    pub db: DbPool,
    pub sessions: SessionStore,
    pub manager: Arc<AppManager>,
}

impl AppState {
    pub fn new(config: Config, db: DbPool, manager: Arc<AppManager>) -> Self {
        Self {
            config,
            sessions: SessionStore::new(db.clone()),
            db,
            manager,
        }
    }
}
