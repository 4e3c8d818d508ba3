use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::{HttpManagementApi, ManagementApi, PatchDocument};
use crate::config::{affects_connection, SyncConfig};
use crate::error::{FlagSyncError, Result};
use crate::flag::FlagRecord;
use crate::metrics::Metrics;
use crate::notifier::{ChangeEvent, ChangeKind, ChangeNotifier, SubscriptionId};
use crate::requestor::{HttpRequestor, Requestor};
use crate::store::FlagRecordStore;
use crate::stream::{ConnectionState, EventSource, HttpEventSource, StreamProcessor, UpdateSink};

/// Builds the network collaborators for a given configuration.
pub trait Transport: Send + Sync {
    fn requestor(&self, config: &SyncConfig) -> Arc<dyn Requestor>;

    fn event_source(&self, config: &SyncConfig) -> Arc<dyn EventSource>;

    fn management_api(&self, config: &SyncConfig) -> Arc<dyn ManagementApi>;
}

/// reqwest-backed collaborators.
pub struct HttpTransport;

impl Transport for HttpTransport {
    fn requestor(&self, config: &SyncConfig) -> Arc<dyn Requestor> {
        Arc::new(HttpRequestor::new(config))
    }

    fn event_source(&self, config: &SyncConfig) -> Arc<dyn EventSource> {
        Arc::new(HttpEventSource::new(config))
    }

    fn management_api(&self, config: &SyncConfig) -> Arc<dyn ManagementApi> {
        Arc::new(HttpManagementApi::new(config))
    }
}

/// Collaborators of one start/stop cycle.
struct Running {
    requestor: Arc<dyn Requestor>,
    sink: Arc<UpdateSink>,
    processor: Option<StreamProcessor>,
}

/// Public query and sync surface of the local flag cache.
///
/// Reads never touch the network. Writes go through the management API and
/// are followed by a direct refresh of the affected flag, so callers see
/// their own change without waiting for the stream to deliver it.
pub struct FlagStore {
    config: RwLock<SyncConfig>,
    transport: Arc<dyn Transport>,
    api: RwLock<Arc<dyn ManagementApi>>,
    store: Arc<FlagRecordStore>,
    notifier: Arc<ChangeNotifier>,
    metrics: Arc<Metrics>,
    state: Arc<watch::Sender<ConnectionState>>,
    running: Mutex<Option<Running>>,
}

impl FlagStore {
    pub fn new(config: SyncConfig) -> Self {
        Self::with_transport(config, Arc::new(HttpTransport))
    }

    pub fn with_transport(config: SyncConfig, transport: Arc<dyn Transport>) -> Self {
        let api = transport.management_api(&config);
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            config: RwLock::new(config),
            transport,
            api: RwLock::new(api),
            store: Arc::new(FlagRecordStore::new()),
            notifier: Arc::new(ChangeNotifier::new()),
            metrics: Arc::new(Metrics::new()),
            state: Arc::new(state),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> SyncConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_configured(&self) -> bool {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_configured()
    }

    /// `Err(Configuration)` naming the missing settings, for callers that
    /// want to report why the cache is disabled.
    pub fn ensure_configured(&self) -> Result<()> {
        let missing = self.config().missing_settings();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(FlagSyncError::Configuration(missing.join(", ")))
        }
    }

    fn api(&self) -> Arc<dyn ManagementApi> {
        Arc::clone(&self.api.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn running_parts(&self) -> Option<(Arc<dyn Requestor>, Arc<UpdateSink>)> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|r| (Arc::clone(&r.requestor), Arc::clone(&r.sink)))
    }

    /// Connect and wait for the first snapshot.
    ///
    /// Without the required settings the cache stays empty and this returns
    /// `Ok(())` without touching the network. Calling `start` on a running
    /// cache does nothing. If the first connection fails the error is
    /// returned, but the stream keeps retrying in the background.
    pub async fn start(&self) -> Result<()> {
        let config = self.config();
        let missing = config.missing_settings();
        if !missing.is_empty() {
            warn!(missing = ?missing, "flag cache not configured, staying disabled");
            return Ok(());
        }

        let ready = {
            let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
            if running.is_some() {
                debug!("flag cache already started");
                return Ok(());
            }

            let requestor = self.transport.requestor(&config);
            let sink = Arc::new(UpdateSink::new(
                Arc::clone(&self.store),
                Arc::clone(&self.notifier),
                Arc::clone(&self.metrics),
            ));

            if config.stream {
                let (processor, ready) = StreamProcessor::spawn(
                    &config,
                    self.transport.event_source(&config),
                    Arc::clone(&requestor),
                    Arc::clone(&sink),
                    Arc::clone(&self.metrics),
                    Arc::clone(&self.state),
                );
                *running = Some(Running {
                    requestor,
                    sink,
                    processor: Some(processor),
                });
                Some(ready)
            } else {
                *running = Some(Running {
                    requestor,
                    sink,
                    processor: None,
                });
                None
            }
        };

        match ready {
            Some(ready) => {
                info!(
                    project = config.project.as_deref().unwrap_or_default(),
                    env = config.env.as_deref().unwrap_or_default(),
                    "starting flag stream"
                );
                ready.await.unwrap_or(Err(FlagSyncError::Stopped))
            }
            None => self.load_all().await,
        }
    }

    /// Fill the cache from one full fetch, for configurations without streaming.
    async fn load_all(&self) -> Result<()> {
        let Some((requestor, sink)) = self.running_parts() else {
            return Err(FlagSyncError::Stopped);
        };
        let flags = requestor.fetch_all().await?;
        let count = flags.len();
        if sink.init(flags) {
            info!(flags = count, "flags loaded without streaming");
            Ok(())
        } else {
            Err(FlagSyncError::Stopped)
        }
    }

    /// Close the stream and empty the cache. Safe to call at any time.
    pub fn stop(&self) {
        let Some(running) = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        running.sink.close();
        if let Some(processor) = running.processor {
            processor.stop();
        }
        self.state.send_replace(ConnectionState::Stopped);
        self.store.clear();
        self.metrics.flags_total.set(0);
        self.notifier.notify(ChangeEvent::new(ChangeKind::Cleared));
        info!("flag cache stopped");
    }

    /// Swap in `config`. The cache restarts only when `changed` names a
    /// connection setting; that is the only way to retarget a live cache.
    pub async fn reload(&self, config: SyncConfig, changed: &[&str]) -> Result<()> {
        let api = self.transport.management_api(&config);
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
        *self.api.write().unwrap_or_else(PoisonError::into_inner) = api;

        if !affects_connection(changed) {
            return Ok(());
        }
        info!(changed = ?changed, "connection settings changed, restarting flag cache");
        self.stop();
        self.start().await
    }

    pub async fn get_flag(&self, key: &str) -> Option<FlagRecord> {
        self.store.get(key)
    }

    pub async fn list_flags(&self) -> Vec<String> {
        self.store.keys()
    }

    pub async fn all_flags_metadata(&self) -> HashMap<String, FlagRecord> {
        self.store.all()
    }

    pub fn is_initialized(&self) -> bool {
        self.store.is_initialized()
    }

    /// Fetch one flag directly and store it, bypassing the stream.
    /// Does nothing when the cache is not running.
    pub async fn force_refresh(&self, key: &str) -> Result<()> {
        let Some((requestor, sink)) = self.running_parts() else {
            debug!(key, "flag cache not running, skipping refresh");
            return Ok(());
        };
        let flag = requestor.fetch_one(key).await?;
        let version = flag.version;
        if sink.upsert(key, flag) {
            debug!(key, version, "flag refreshed");
        }
        Ok(())
    }

    /// Patch a flag remotely, then refresh it locally before returning.
    /// On failure the cache is left untouched and the error is returned as is.
    pub async fn apply_patch(
        &self,
        project_key: &str,
        flag_key: &str,
        patch: &PatchDocument,
    ) -> Result<FlagRecord> {
        let updated = self
            .api()
            .patch_feature_flag(project_key, flag_key, patch)
            .await?;
        self.force_refresh(flag_key).await?;
        Ok(updated)
    }

    /// Read a flag straight from the management API.
    pub async fn get_remote_flag(&self, project_key: &str, flag_key: &str) -> Result<FlagRecord> {
        self.api().get_feature_flag(project_key, flag_key).await
    }

    pub fn subscribe(
        &self,
        handler: impl Fn(&ChangeEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.notifier.subscribe(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.notifier.unsubscribe(id)
    }

    pub fn unsubscribe_all(&self) {
        self.notifier.unsubscribe_all();
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn registry(&self) -> &prometheus::Registry {
        self.metrics.registry()
    }
}

impl Drop for FlagStore {
    fn drop(&mut self) {
        if let Some(running) = self
            .running
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            running.sink.close();
            if let Some(processor) = running.processor {
                processor.stop();
            }
        }
    }
}
