//! In-process event bus for gitspace, infra and operations events
//!
//! Each topic is an mpsc channel. Emitters never block on handlers: a reader
//! task drains the channel and runs every payload through its handler on a
//! bounded number of concurrent tasks, retrying failures.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::domain::event::{
    GitspaceEntityType, GitspaceEventPayload, GitspaceEventType, GitspaceInfraEventPayload,
    GitspaceOperationsEventPayload,
};
use crate::domain::gitspace::GitspaceConfig;
use crate::error::Result;

const TOPIC_CAPACITY: usize = 1024;

/// Emits lifecycle events
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventReporter: Send + Sync {
    async fn emit_gitspace_event(&self, payload: GitspaceEventPayload);

    async fn emit_infra_event(&self, payload: GitspaceInfraEventPayload);

    async fn emit_operations_event(&self, payload: GitspaceOperationsEventPayload);
}

/// Build the payload for an event about the latest instance of `config`
pub fn gitspace_event(config: &GitspaceConfig, event_type: GitspaceEventType) -> GitspaceEventPayload {
    GitspaceEventPayload {
        query_key: config.identifier.clone(),
        entity_id: config.instance.as_ref().map(|i| i.id).unwrap_or(config.id),
        entity_type: GitspaceEntityType::GitspaceInstance,
        event_type,
        timestamp: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
    }
}

/// Async handler for one topic
pub type EventHandler<P> = Arc<dyn Fn(P) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Reader group settings
#[derive(Debug, Clone, Copy)]
pub struct ReaderConfig {
    /// Handlers running at the same time
    pub concurrency: usize,
    /// Quiet period after which the reader logs that it is idle
    pub idle_timeout: Duration,
    /// Extra attempts for a failing handler
    pub max_retries: u32,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            idle_timeout: Duration::from_secs(300),
            max_retries: 2,
        }
    }
}

/// Sending side of the bus
#[derive(Clone)]
pub struct EventBus {
    gitspace_tx: mpsc::Sender<GitspaceEventPayload>,
    infra_tx: mpsc::Sender<GitspaceInfraEventPayload>,
    operations_tx: mpsc::Sender<GitspaceOperationsEventPayload>,
}

/// Receiving side of the bus, consumed when handlers are registered
pub struct EventReaders {
    gitspace_rx: mpsc::Receiver<GitspaceEventPayload>,
    infra_rx: mpsc::Receiver<GitspaceInfraEventPayload>,
    operations_rx: mpsc::Receiver<GitspaceOperationsEventPayload>,
}

/// Handlers for every topic
pub struct EventHandlers {
    pub gitspace: EventHandler<GitspaceEventPayload>,
    pub infra: EventHandler<GitspaceInfraEventPayload>,
    pub operations: EventHandler<GitspaceOperationsEventPayload>,
}

impl EventBus {
    /// Create a new bus. Returns both the bus (for sending) and the readers.
    pub fn new() -> (Self, EventReaders) {
        let (gitspace_tx, gitspace_rx) = mpsc::channel(TOPIC_CAPACITY);
        let (infra_tx, infra_rx) = mpsc::channel(TOPIC_CAPACITY);
        let (operations_tx, operations_rx) = mpsc::channel(TOPIC_CAPACITY);

        (
            Self {
                gitspace_tx,
                infra_tx,
                operations_tx,
            },
            EventReaders {
                gitspace_rx,
                infra_rx,
                operations_rx,
            },
        )
    }
}

#[async_trait]
impl EventReporter for EventBus {
    async fn emit_gitspace_event(&self, payload: GitspaceEventPayload) {
        debug!(
            gitspace = %payload.query_key,
            event = %payload.event_type,
            "Emitting gitspace event"
        );
        if let Err(e) = self.gitspace_tx.send(payload).await {
            error!("Failed to emit gitspace event {}: bus closed", e.0.event_type);
        }
    }

    async fn emit_infra_event(&self, payload: GitspaceInfraEventPayload) {
        debug!(
            instance = %payload.infra.gitspace_instance_identifier,
            event = payload.event_type.as_str(),
            "Emitting infra event"
        );
        if let Err(e) = self.infra_tx.send(payload).await {
            error!(
                "Failed to emit infra event {} for {}: bus closed",
                e.0.event_type.as_str(),
                e.0.infra.gitspace_instance_identifier
            );
        }
    }

    async fn emit_operations_event(&self, payload: GitspaceOperationsEventPayload) {
        debug!(
            instance = %payload.gitspace_instance_identifier,
            event = payload.event_type.as_str(),
            "Emitting operations event"
        );
        if let Err(e) = self.operations_tx.send(payload).await {
            error!(
                "Failed to emit operations event {} for {}: bus closed",
                e.0.event_type.as_str(),
                e.0.gitspace_instance_identifier
            );
        }
    }
}

impl EventReaders {
    /// Start one reader task per topic
    pub fn spawn(
        self,
        handlers: EventHandlers,
        config: ReaderConfig,
        shutdown: CancellationToken,
    ) -> JoinSet<()> {
        let mut readers = JoinSet::new();
        readers.spawn(run_reader(
            "gitspace",
            self.gitspace_rx,
            handlers.gitspace,
            config,
            shutdown.clone(),
        ));
        readers.spawn(run_reader(
            "gitspace_infra",
            self.infra_rx,
            handlers.infra,
            config,
            shutdown.clone(),
        ));
        readers.spawn(run_reader(
            "gitspace_operations",
            self.operations_rx,
            handlers.operations,
            config,
            shutdown,
        ));
        readers
    }
}

async fn run_reader<P>(
    topic: &'static str,
    mut rx: mpsc::Receiver<P>,
    handler: EventHandler<P>,
    config: ReaderConfig,
    shutdown: CancellationToken,
) where
    P: Clone + Send + 'static,
{
    let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
    let mut in_flight = JoinSet::new();

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = tokio::time::timeout(config.idle_timeout, rx.recv()) => next,
        };

        let payload = match next {
            Ok(Some(payload)) => payload,
            Ok(None) => break,
            Err(_) => {
                debug!(topic, "No events within {:?}", config.idle_timeout);
                continue;
            }
        };

        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let handler = handler.clone();
        in_flight.spawn(async move {
            handle_with_retries(topic, handler, payload, config.max_retries).await;
            drop(permit);
        });

        // Reap finished handlers so the set does not grow unbounded
        while in_flight.try_join_next().is_some() {}
    }

    while in_flight.join_next().await.is_some() {}
    debug!(topic, "Event reader stopped");
}

async fn handle_with_retries<P: Clone>(
    topic: &str,
    handler: EventHandler<P>,
    payload: P,
    max_retries: u32,
) {
    let mut attempt = 0;
    loop {
        match handler(payload.clone()).await {
            Ok(()) => return,
            Err(e) if attempt < max_retries => {
                attempt += 1;
                warn!(topic, attempt, "Event handler failed, retrying: {}", e);
                tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
            }
            Err(e) => {
                error!(topic, "Event handler failed after {} attempts: {}", attempt + 1, e);
                return;
            }
        }
    }
}
