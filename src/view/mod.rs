//! Per-organization view of the status page.
//!
//! Each organization gets one task that owns its [`StatusState`]. Channel
//! messages, full re-fetches and confirmed mutations all go through the
//! task's queue, so they are applied strictly one after the other. Readers
//! never touch the state; they get [`Snapshot`]s through a `watch` channel.

mod state;

pub use state::{Applied, Change, EntityKey, Snapshot, StatusState};

use chrono::Utc;
use log::{debug, error, info};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{Mutex, mpsc, oneshot, watch};

use crate::backend::{BackendError, StatusBackend};
use crate::config::ViewConfig;
use crate::model::ChannelEvent;
use crate::normalize::normalize_organization_status;

#[derive(Debug, thiserror::Error)]
pub enum ViewError {
    #[error("View of {0} is closed")]
    Closed(String),
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

pub type Result<T> = std::result::Result<T, ViewError>;

type SyncReply = oneshot::Sender<std::result::Result<(), BackendError>>;

pub enum ViewCommand {
    Event(ChannelEvent),
    /// Throw local state away and re-fetch it from the backend.
    Resync(Option<SyncReply>),
    Commit { ticket: u64, change: Change },
}

struct ViewTask {
    slug: Arc<str>,
    backend: Arc<dyn StatusBackend>,
    state: StatusState,
    rx: mpsc::Receiver<ViewCommand>,
    snapshots: watch::Sender<Arc<Snapshot>>,
    closed: watch::Receiver<bool>,
}

impl ViewTask {
    async fn run(mut self) {
        info!("View of {} started", self.slug);
        loop {
            tokio::select! {
                biased;
                _ = self.closed.changed() => break,
                maybe_command = self.rx.recv() => {
                    match maybe_command {
                        Some(command) => self.handle(command).await,
                        None => break,
                    }
                }
            }
        }
        info!("View of {} stopped", self.slug);
    }

    async fn handle(&mut self, command: ViewCommand) {
        let mut reply = None;
        let changed = match command {
            ViewCommand::Event(event) => match self.state.apply_event(event, Utc::now()) {
                Applied::Changed => true,
                Applied::Ignored => false,
                Applied::NeedsResync => {
                    info!("{} received a change for an unknown entity, re-fetching", self.slug);
                    self.resync().await.is_ok()
                }
            },
            ViewCommand::Resync(reply_to) => {
                let result = self.resync().await;
                let changed = result.is_ok();
                reply = reply_to.map(|reply_to| (reply_to, result));
                changed
            }
            ViewCommand::Commit { ticket, change } => {
                self.state.commit(ticket, change) == Applied::Changed
            }
        };

        if changed {
            let snapshot = self.state.snapshot();
            debug!("{} is now at version {}", self.slug, snapshot.version);
            self.snapshots.send_replace(Arc::new(snapshot));
        }
        // Only answer once the snapshot is out.
        if let Some((reply_to, result)) = reply {
            let _ = reply_to.send(result);
        }
    }

    async fn resync(&mut self) -> std::result::Result<(), BackendError> {
        match self.backend.organization_status(&self.slug).await {
            Ok(raw) => {
                let status = normalize_organization_status(&raw);
                info!(
                    "Fetched {} ({} services, {} incidents)",
                    self.slug,
                    status.services.len(),
                    status.incidents.len()
                );
                self.state.replace(status, Utc::now());
                Ok(())
            }
            Err(e) => {
                error!("Failed to fetch status of {}: {e}", self.slug);
                Err(e)
            }
        }
    }
}

/// Cheap, cloneable access to one organization's view.
#[derive(Clone)]
pub struct ViewHandle {
    slug: Arc<str>,
    tx: mpsc::Sender<ViewCommand>,
    snapshots: watch::Receiver<Arc<Snapshot>>,
    closed: Arc<watch::Sender<bool>>,
}

impl ViewHandle {
    /// Start the view task. The view starts empty; it is filled by a
    /// channel client connecting or by [`ViewHandle::sync`].
    pub fn spawn(slug: &str, backend: Arc<dyn StatusBackend>, queue_capacity: usize) -> Self {
        let slug: Arc<str> = Arc::from(slug);
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let (snapshots_tx, snapshots) = watch::channel(Arc::new(Snapshot::default()));
        let (closed, closed_rx) = watch::channel(false);

        let task = ViewTask {
            slug: slug.clone(),
            backend,
            state: StatusState::new(),
            rx,
            snapshots: snapshots_tx,
            closed: closed_rx,
        };
        tokio::spawn(task.run());

        Self {
            slug,
            tx,
            snapshots,
            closed: Arc::new(closed),
        }
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.snapshots.clone()
    }

    /// Wait for the first snapshot that satisfies `predicate`.
    pub async fn wait_for(&self, mut predicate: impl FnMut(&Snapshot) -> bool) -> Result<Arc<Snapshot>> {
        let mut snapshots = self.subscribe();
        let snapshot = snapshots
            .wait_for(|snapshot| predicate(snapshot.as_ref()))
            .await
            .map_err(|_| self.closed_error())?;
        Ok(Arc::clone(&snapshot))
    }

    fn closed_error(&self) -> ViewError {
        ViewError::Closed(self.slug.to_string())
    }

    async fn send(&self, command: ViewCommand) -> Result<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        self.tx
            .send(command)
            .await
            .map_err(|_| self.closed_error())
    }

    pub async fn apply(&self, event: ChannelEvent) -> Result<()> {
        self.send(ViewCommand::Event(event)).await
    }

    /// Queue a full re-fetch without waiting for it.
    pub async fn resync(&self) -> Result<()> {
        self.send(ViewCommand::Resync(None)).await
    }

    /// Re-fetch and wait until the result is applied.
    pub async fn sync(&self) -> Result<()> {
        let (reply, result) = oneshot::channel();
        self.send(ViewCommand::Resync(Some(reply))).await?;
        result.await.map_err(|_| self.closed_error())??;
        Ok(())
    }

    pub async fn commit(&self, ticket: u64, change: Change) -> Result<()> {
        self.send(ViewCommand::Commit { ticket, change }).await
    }

    /// Stop the view. Anything still queued or sent later is discarded.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the view is closed.
    pub async fn closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

/// Bounds a test wait so a regression fails instead of hanging the suite.
#[cfg(test)]
pub(crate) async fn within<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(std::time::Duration::from_secs(5), future)
        .await
        .expect("timed out after 5s")
}

/// Hands out one view per organization.
pub struct ViewRegistry {
    backend: Arc<dyn StatusBackend>,
    queue_capacity: usize,
    views: Mutex<HashMap<String, ViewHandle>>,
}

impl ViewRegistry {
    pub fn new(backend: Arc<dyn StatusBackend>, config: &ViewConfig) -> Self {
        Self {
            backend,
            queue_capacity: config.queue_capacity,
            views: Mutex::new(HashMap::new()),
        }
    }

    pub async fn open(&self, slug: &str) -> ViewHandle {
        let mut views = self.views.lock().await;
        match views.get(slug) {
            Some(view) if !view.is_closed() => view.clone(),
            _ => {
                let view = ViewHandle::spawn(slug, self.backend.clone(), self.queue_capacity);
                views.insert(slug.to_string(), view.clone());
                view
            }
        }
    }

    pub async fn close(&self, slug: &str) {
        if let Some(view) = self.views.lock().await.remove(slug) {
            view.close();
        }
    }

    /// Queue a re-fetch on every open view.
    pub async fn resync_all(&self) {
        for (slug, view) in self.views.lock().await.iter() {
            if let Err(e) = view.resync().await {
                debug!("Skipping re-fetch of {slug}: {e}");
            }
        }
    }

    pub async fn close_all(&self) {
        for (_, view) in self.views.lock().await.drain() {
            view.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggregateStatus;
    use crate::backend::{MemoryBackend, NewService};
    use crate::model::{Service, ServiceStatus};

    async fn backend_with_service() -> (Arc<MemoryBackend>, String) {
        let backend = Arc::new(MemoryBackend::new());
        let org = backend.add_organization("Acme", "acme").await;
        let raw = backend
            .create_service(
                &org,
                &NewService {
                    name: "API".into(),
                    description: "Public API".into(),
                    status: ServiceStatus::Operational,
                },
            )
            .await
            .unwrap();
        let id = crate::normalize::normalize_service(&raw).unwrap().id;
        (backend, id)
    }

    #[tokio::test]
    async fn test_sync_fills_snapshot() {
        let (backend, service_id) = backend_with_service().await;
        let view = ViewHandle::spawn("acme", backend, 8);
        assert_eq!(view.snapshot().version, 0);

        view.sync().await.unwrap();
        let snapshot = view.snapshot();
        assert!(snapshot.last_synced.is_some());
        assert!(snapshot.services.contains_key(&service_id));
        assert_eq!(snapshot.organization.as_ref().unwrap().name, "Acme");
    }

    #[tokio::test]
    async fn test_sync_reports_backend_errors() {
        let (backend, _) = backend_with_service().await;
        let view = ViewHandle::spawn("nobody", backend, 8);
        assert!(matches!(
            view.sync().await,
            Err(ViewError::Backend(BackendError::NotFound))
        ));
    }

    #[tokio::test]
    async fn test_events_apply_in_order() {
        let (backend, service_id) = backend_with_service().await;
        let view = ViewHandle::spawn("acme", backend, 8);
        view.sync().await.unwrap();

        for status in [ServiceStatus::Degraded, ServiceStatus::MajorOutage] {
            view.apply(ChannelEvent::StatusChange {
                service_id: service_id.clone(),
                new_status: status,
                last_checked: None,
            })
            .await
            .unwrap();
        }
        let snapshot = within(view.wait_for(|s| s.derived.aggregate == AggregateStatus::MajorOutage))
            .await
            .unwrap();
        assert_eq!(snapshot.services[&service_id].status, ServiceStatus::MajorOutage);
    }

    #[tokio::test]
    async fn test_unknown_service_triggers_refetch() {
        let (backend, _) = backend_with_service().await;
        let view = ViewHandle::spawn("acme", backend.clone(), 8);
        view.sync().await.unwrap();
        let fetches = backend.status_fetches();

        view.apply(ChannelEvent::StatusChange {
            service_id: "unknown".into(),
            new_status: ServiceStatus::Degraded,
            last_checked: None,
        })
        .await
        .unwrap();
        // A sync queued behind the event proves the event was handled first.
        view.sync().await.unwrap();
        assert_eq!(backend.status_fetches(), fetches + 2);
    }

    #[tokio::test]
    async fn test_closed_view_discards_commits() {
        let (backend, service_id) = backend_with_service().await;
        let view = ViewHandle::spawn("acme", backend, 8);
        view.close();
        view.closed().await;

        let result = view
            .commit(
                1,
                Change::UpsertService(Service {
                    id: service_id,
                    name: "API".into(),
                    status: ServiceStatus::MajorOutage,
                    last_checked: Utc::now(),
                    description: None,
                }),
            )
            .await;
        assert!(matches!(result, Err(ViewError::Closed(_))));
        assert_eq!(view.snapshot().version, 0);
    }

    #[tokio::test]
    async fn test_registry_hands_out_one_view_per_organization() {
        let (backend, _) = backend_with_service().await;
        let registry = ViewRegistry::new(backend, &ViewConfig::default());

        let first = registry.open("acme").await;
        let second = registry.open("acme").await;
        first.sync().await.unwrap();
        assert_eq!(second.snapshot().version, first.snapshot().version);

        registry.close("acme").await;
        assert!(second.is_closed());
        let reopened = registry.open("acme").await;
        assert!(!reopened.is_closed());
    }

    #[tokio::test]
    async fn test_resync_all_refetches_open_views() {
        let (backend, _) = backend_with_service().await;
        let registry = ViewRegistry::new(backend.clone(), &ViewConfig::default());
        let view = registry.open("acme").await;
        view.sync().await.unwrap();

        registry.resync_all().await;
        within(view.wait_for(|s| s.version >= 2)).await.unwrap();
        assert_eq!(backend.status_fetches(), 2);
    }
}
