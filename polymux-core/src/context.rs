//! Startup-time registries handed to the engine.
//!
//! Nothing here is global: a [`ServerContext`] is built once, frozen behind
//! an `Arc`, and passed to every loop thread. Independent servers in one
//! process simply use independent contexts.
use std::{fmt, sync::Arc};

use tracing::{debug, info};

use crate::{
    config::ServerConfig,
    handler::ProtocolDetector,
    module::ServerModule,
    worker::{WorkerPool, WorkerPoolError},
    AnyResult,
};

pub struct ServerContext {
    config: ServerConfig,
    detectors: Vec<Arc<dyn ProtocolDetector>>,
    worker_pool: Arc<WorkerPool>,
}

impl ServerContext {
    pub fn builder(config: ServerConfig) -> Result<ServerContextBuilder, WorkerPoolError> {
        ServerContextBuilder::new(config)
    }

    #[inline]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Active detectors in registration order.
    #[inline]
    pub fn detectors(&self) -> &[Arc<dyn ProtocolDetector>] {
        &self.detectors
    }

    #[inline]
    pub fn worker_pool(&self) -> &Arc<WorkerPool> {
        &self.worker_pool
    }
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerContext")
            .field("listener", &self.config.listener)
            .field(
                "detectors",
                &self.detectors.iter().map(|d| d.name()).collect::<Vec<_>>(),
            )
            .field("worker_pool", &self.worker_pool.capacity())
            .finish()
    }
}

pub struct ServerContextBuilder {
    config: ServerConfig,
    detectors: Vec<Arc<dyn ProtocolDetector>>,
    worker_pool: Arc<WorkerPool>,
}

impl ServerContextBuilder {
    pub fn new(config: ServerConfig) -> Result<Self, WorkerPoolError> {
        let worker_pool = Arc::new(WorkerPool::new(config.worker_pool.capacity)?);
        Ok(Self {
            config,
            detectors: Vec::new(),
            worker_pool,
        })
    }

    #[inline]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[inline]
    pub fn worker_pool(&self) -> &Arc<WorkerPool> {
        &self.worker_pool
    }

    /// Appends a detector unless it supports none of the enabled protocols.
    /// Returns whether it was kept.
    pub fn register_detector(&mut self, detector: Arc<dyn ProtocolDetector>) -> bool {
        if !detector.supports(&self.config.protocols) {
            debug!(
                "detector {} skipped, enabled protocols: {:?}",
                detector.name(),
                self.config.protocols
            );
            return false;
        }
        debug!("detector {} registered", detector.name());
        self.detectors.push(detector);
        true
    }

    /// Initializes a protocol module against this context.
    pub fn install<M: ServerModule>(&mut self, module: &mut M) -> AnyResult<()> {
        let config = self.config.clone();
        module.initialize(&config, self)?;
        info!("module {} initialized", module.name());
        Ok(())
    }

    pub fn build(self) -> Arc<ServerContext> {
        Arc::new(ServerContext {
            config: self.config,
            detectors: self.detectors,
            worker_pool: self.worker_pool,
        })
    }
}
