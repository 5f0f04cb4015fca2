use anyhow::Result;
use std::sync::Arc;

use crate::adapters;
use crate::config::AppConfig;
use crate::core::directory::{AccountDirectory, DirectorySnapshot};
use crate::core::transfer_engine::{self, TransferEngineType, TransferTarget};

/// Configuration plus the external collaborators a run talks to.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub directory: Arc<dyn AccountDirectory>,
    pub snapshot: Arc<dyn DirectorySnapshot>,
    pub transfer: Arc<dyn TransferTarget>,
}

impl AppContext {
    pub fn new(
        config: AppConfig,
        directory: Arc<dyn AccountDirectory>,
        snapshot: Arc<dyn DirectorySnapshot>,
        transfer: Arc<dyn TransferTarget>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            directory,
            snapshot,
            transfer,
        }
    }

    /// Wires the real collaborators, or the simulated ones in simulation mode.
    pub fn from_config(config: AppConfig) -> Result<Self> {
        let engine = if config.simulation {
            TransferEngineType::Simulated
        } else {
            TransferEngineType::Http
        };
        let transfer = transfer_engine::create_engine(engine, &config)?;
        let directory = adapters::get_directory(&config);
        let snapshot = adapters::get_snapshot(&config);
        Ok(Self::new(config, directory, snapshot, transfer))
    }
}
