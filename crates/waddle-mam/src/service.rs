//! Wiring of the archive components and their background tasks.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::archiver::ArchiverSettings;
use crate::config::ArchiveConfig;
use crate::conversation::{
    ConversationEvent, ConversationManager, ConversationRouter, RouterRole, WritePath,
};
use crate::error::MamError;
use crate::gate::AvailabilityGate;
use crate::handler::{MamHandler, NoRooms, RoomDirectory};
use crate::index::FullTextIndex;
use crate::query::QueryEngine;
use crate::store::{ArchiveStore, LibSqlArchiveStore};

/// The message archive of one server node.
pub struct MonitoringService {
    config: Arc<ArchiveConfig>,
    store: Arc<dyn ArchiveStore>,
    write: Arc<WritePath>,
    manager: Arc<ConversationManager>,
    index: Option<Arc<FullTextIndex>>,
    engine: Arc<QueryEngine>,
    handler: Arc<MamHandler>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MonitoringService {
    /// Open the configured store and build every component on top of it.
    pub async fn open(
        config: ArchiveConfig,
        rooms: Arc<dyn RoomDirectory>,
    ) -> Result<Self, MamError> {
        let store: Arc<dyn ArchiveStore> = match &config.store.path {
            Some(path) => Arc::new(LibSqlArchiveStore::open_local(path).await?),
            None => Arc::new(LibSqlArchiveStore::in_memory().await?),
        };
        Self::with_store(config, store, rooms).await
    }

    /// Build the service over an existing store.
    pub async fn with_store(
        config: ArchiveConfig,
        store: Arc<dyn ArchiveStore>,
        rooms: Arc<dyn RoomDirectory>,
    ) -> Result<Self, MamError> {
        let config = Arc::new(config);
        let shutdown = CancellationToken::new();

        let write = Arc::new(WritePath::new(
            store.clone(),
            ArchiverSettings::from(&config.archiver),
        ));
        let manager =
            Arc::new(ConversationManager::load(config.clone(), store.clone(), write.clone()).await?);

        let index = if config.index.enabled {
            let index =
                FullTextIndex::open(config.index.path.as_deref(), store.clone(), config.clone())
                    .await?;
            Some(Arc::new(index))
        } else {
            None
        };

        let engine = Arc::new(QueryEngine::new(config.clone(), store.clone(), index.clone()));
        let gate = Arc::new(AvailabilityGate::new(
            write.eta_sources(),
            config.query.max_wait(),
        ));
        let handler = Arc::new(MamHandler::new(
            config.clone(),
            engine.clone(),
            gate,
            rooms,
            shutdown.child_token(),
        ));

        info!(
            domain = %config.server.domain,
            fulltext = index.is_some(),
            "Message archive ready"
        );

        Ok(Self {
            config,
            store,
            write,
            manager,
            index,
            engine,
            handler,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// A service over an in-memory store without rooms.
    pub async fn in_memory(config: ArchiveConfig) -> Result<Self, MamError> {
        let store = Arc::new(LibSqlArchiveStore::in_memory().await?);
        Self::with_store(config, store, Arc::new(NoRooms)).await
    }

    pub fn config(&self) -> &Arc<ArchiveConfig> {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ArchiveStore> {
        &self.store
    }

    pub fn manager(&self) -> &Arc<ConversationManager> {
        &self.manager
    }

    pub fn engine(&self) -> &Arc<QueryEngine> {
        &self.engine
    }

    pub fn handler(&self) -> &Arc<MamHandler> {
        &self.handler
    }

    pub fn index(&self) -> Option<&Arc<FullTextIndex>> {
        self.index.as_ref()
    }

    /// A router applying events locally while this node owns the
    /// conversations and forwarding them to `outbound` otherwise.
    pub fn router(
        &self,
        role: RouterRole,
        outbound: mpsc::Sender<ConversationEvent>,
    ) -> Arc<ConversationRouter> {
        Arc::new(ConversationRouter::new(self.manager.clone(), role, outbound))
    }

    /// Spawn the archivers and the maintenance schedule.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), MamError> {
        let mut tasks = self.write.spawn(&self.shutdown);

        let maintenance = &self.config.maintenance;
        tasks.push(self.spawn_cleanup(minutes(maintenance.cleanup_interval_minutes)));
        tasks.push(self.spawn_purge(minutes(maintenance.purge_interval_minutes)));

        if let Some(index) = &self.index {
            if index.watermark().await?.is_none() {
                info!("Full-text index has never been built, rebuilding");
                let rebuild = index.rebuild();
                let token = self.shutdown.child_token();
                tasks.push(tokio::spawn(async move {
                    tokio::select! {
                        _ = token.cancelled() => debug!("Shutting down during initial index rebuild"),
                        result = rebuild => match result {
                            Ok(Ok(indexed)) => info!(indexed, "Initial index rebuild finished"),
                            Ok(Err(e)) => error!(error = %e, "Initial index rebuild failed"),
                            Err(e) => error!(error = %e, "Initial index rebuild task failed"),
                        },
                    }
                }));
            }
            tasks.push(self.spawn_index_updates(index.clone()));
        }

        info!(tasks = tasks.len(), "Message archive started");
        self.lock_tasks().extend(tasks);
        Ok(())
    }

    /// Stop the background tasks and drain every archiver queue.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = self.lock_tasks().drain(..).collect();
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        let flushed = self.write.flush_all().await;
        info!(flushed, "Message archive stopped");
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn spawn_cleanup(&self, period: Duration) -> JoinHandle<()> {
        let manager = self.manager.clone();
        let token = self.shutdown.child_token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let ended = manager.cleanup(Utc::now());
                        debug!(ended, "Conversation cleanup sweep");
                    }
                }
            }
        })
    }

    fn spawn_purge(&self, period: Duration) -> JoinHandle<()> {
        let manager = self.manager.clone();
        let index = self.index.clone();
        let token = self.shutdown.child_token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = purge(&manager, index.as_deref(), Utc::now()).await {
                            error!(error = %e, "Retention purge failed");
                        }
                    }
                }
            }
        })
    }

    /// Apply retention to the archive and the full-text index. Returns the
    /// number of purged messages.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, MamError> {
        purge(&self.manager, self.index.as_deref(), now).await
    }

    fn spawn_index_updates(&self, index: Arc<FullTextIndex>) -> JoinHandle<()> {
        let delay = minutes(self.config.index.initial_delay_minutes);
        let period = minutes(self.config.index.update_interval_minutes);
        let token = self.shutdown.child_token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + delay, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = index.update().await {
                            error!(error = %e, "Full-text index update failed");
                        }
                    }
                }
            }
        })
    }
}

async fn purge(
    manager: &ConversationManager,
    index: Option<&FullTextIndex>,
    now: DateTime<Utc>,
) -> Result<usize, MamError> {
    let purged = manager.purge_expired(now).await?;
    if let Some(index) = index {
        index.remove_messages(&purged).await?;
    }
    Ok(purged.len())
}

fn minutes(n: u64) -> Duration {
    Duration::from_secs(n.max(1) * 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_from_str;
    use crate::conversation::MessageEvent;
    use crate::query::QueryRequest;

    fn config() -> ArchiveConfig {
        load_config_from_str(
            "[server]\ndomain = \"capulet.lit\"\n\n[archiving]\nmessages = true\n\n[index]\nenabled = false\n",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_messages() {
        let service = MonitoringService::in_memory(config()).await.unwrap();
        service.start().await.unwrap();

        let event = MessageEvent {
            from: "romeo@capulet.lit/orchard".parse().unwrap(),
            to: "juliet@capulet.lit/balcony".parse().unwrap(),
            body: Some("hello".to_string()),
            stanza: None,
            at: Utc::now(),
        };
        assert!(service.manager().process_message(&event).is_some());
        service.shutdown().await;

        let mut request = QueryRequest::personal("juliet@capulet.lit".parse().unwrap());
        request.max = Some(10);
        let page = service.engine().find_messages(&request).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.messages[0].body.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_purge_removes_full_text_documents() {
        let config = load_config_from_str(
            "[server]\ndomain = \"capulet.lit\"\n\n[archiving]\nmessages = true\n\n\
             [conversation]\nmax_age_days = 1\n",
        )
        .unwrap();
        let service = MonitoringService::in_memory(config).await.unwrap();
        let now = Utc::now();

        for (to, body, at) in [
            ("nurse@capulet.lit", "good night, old friend", now - chrono::Duration::days(3)),
            ("romeo@capulet.lit", "good night, good night", now),
        ] {
            service.manager().process_message(&MessageEvent {
                from: "juliet@capulet.lit/balcony".parse().unwrap(),
                to: to.parse().unwrap(),
                body: Some(body.to_string()),
                stanza: None,
                at,
            });
        }
        service.shutdown().await;
        let index = service.index().unwrap();
        assert_eq!(index.update().await.unwrap(), 2);

        assert_eq!(service.purge_expired(now).await.unwrap(), 1);

        let mut request = QueryRequest::personal("juliet@capulet.lit".parse().unwrap());
        request.text = Some("night".to_string());
        request.max = Some(10);
        let page = service.engine().find_messages(&request).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.messages.len(), 1);
        assert!(page.complete);
        assert_eq!(page.messages[0].body.as_deref(), Some("good night, good night"));
    }

    #[tokio::test]
    async fn test_index_is_built_when_enabled() {
        let config = load_config_from_str(
            "[server]\ndomain = \"capulet.lit\"\n\n[archiving]\nmessages = true\n",
        )
        .unwrap();
        let service = MonitoringService::in_memory(config).await.unwrap();
        assert!(service.index().is_some());
        assert!(service.handler().features().contains(&crate::handler::FULLTEXT_NS));
    }
}
