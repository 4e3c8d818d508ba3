#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};

use flagsync_lib::{
    ByteStream, EventSource, FlagRecord, FlagSyncError, ManagementApi, PatchDocument, Requestor,
    Result, SyncConfig, Transport,
};

pub fn configured() -> SyncConfig {
    SyncConfig {
        sdk_key: Some("sdk-test".into()),
        api_token: Some("api-test".into()),
        project: Some("default".into()),
        env: Some("test".into()),
        initial_reconnect_delay_ms: 5,
        max_reconnect_delay_ms: 20,
        ..SyncConfig::default()
    }
}

pub fn flag(key: &str, version: u64, on: bool) -> FlagRecord {
    FlagRecord {
        on,
        ..FlagRecord::new(key, version)
    }
}

pub fn put_frame(flags: &[FlagRecord]) -> String {
    let map: HashMap<&str, &FlagRecord> = flags.iter().map(|f| (f.key.as_str(), f)).collect();
    format!("event: put\ndata: {}\n\n", serde_json::to_string(&map).unwrap())
}

pub fn patch_frame(flag: &FlagRecord) -> String {
    format!(
        "event: patch\ndata: {}\n\n",
        serde_json::json!({ "path": format!("/{}", flag.key), "data": flag })
    )
}

pub fn delete_frame(key: &str, version: u64) -> String {
    format!(
        "event: delete\ndata: {}\n\n",
        serde_json::json!({ "path": format!("/{}", key), "version": version })
    )
}

/// Scripted push channel: each `connect` pops the next connection. A
/// connection yields its frames and then stays open. With the script
/// exhausted, connects never resolve.
#[derive(Default)]
pub struct FakeSource {
    connections: Mutex<VecDeque<Result<Vec<String>>>>,
    pub connects: AtomicUsize,
}

impl FakeSource {
    pub fn push(&self, connection: Result<Vec<String>>) {
        self.connections.lock().unwrap().push_back(connection);
    }
}

#[async_trait]
impl EventSource for FakeSource {
    async fn connect(&self) -> Result<ByteStream> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let next = self.connections.lock().unwrap().pop_front();
        match next {
            Some(Ok(frames)) => {
                let chunks: Vec<Result<Bytes>> =
                    frames.into_iter().map(|f| Ok(Bytes::from(f))).collect();
                Ok(stream::iter(chunks).chain(stream::pending()).boxed())
            }
            Some(Err(e)) => Err(e),
            None => futures::future::pending().await,
        }
    }
}

/// Requestor backed by a mutable map, counting every call.
#[derive(Default)]
pub struct FakeRequestor {
    pub flags: Mutex<HashMap<String, FlagRecord>>,
    pub fail_with: Mutex<Option<FlagSyncError>>,
    pub calls: AtomicUsize,
}

impl FakeRequestor {
    pub fn set(&self, record: FlagRecord) {
        self.flags.lock().unwrap().insert(record.key.clone(), record);
    }
}

#[async_trait]
impl Requestor for FakeRequestor {
    async fn fetch_all(&self) -> Result<HashMap<String, FlagRecord>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.fail_with.lock().unwrap().clone() {
            return Err(e);
        }
        Ok(self.flags.lock().unwrap().clone())
    }

    async fn fetch_one(&self, key: &str) -> Result<FlagRecord> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.fail_with.lock().unwrap().clone() {
            return Err(e);
        }
        self.flags
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| FlagSyncError::NotFound(key.to_string()))
    }
}

/// Management API that records patches and answers with a scripted result.
#[derive(Default)]
pub struct FakeApi {
    pub patches: Mutex<Vec<(String, String, PatchDocument)>>,
    pub response: Mutex<Option<Result<FlagRecord>>>,
}

#[async_trait]
impl ManagementApi for FakeApi {
    async fn get_feature_flag(&self, _project_key: &str, flag_key: &str) -> Result<FlagRecord> {
        Err(FlagSyncError::NotFound(flag_key.to_string()))
    }

    async fn patch_feature_flag(
        &self,
        project_key: &str,
        flag_key: &str,
        patch: &PatchDocument,
    ) -> Result<FlagRecord> {
        self.patches.lock().unwrap().push((
            project_key.to_string(),
            flag_key.to_string(),
            patch.clone(),
        ));
        self.response
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Ok(FlagRecord::new(flag_key, 1)))
    }
}

/// Hands out the same fakes for every configuration and counts how often
/// the cache asked for network collaborators.
#[derive(Default)]
pub struct FakeTransport {
    pub source: Arc<FakeSource>,
    pub requestor: Arc<FakeRequestor>,
    pub api: Arc<FakeApi>,
    pub built: AtomicUsize,
}

impl Transport for FakeTransport {
    fn requestor(&self, _config: &SyncConfig) -> Arc<dyn Requestor> {
        self.built.fetch_add(1, Ordering::SeqCst);
        Arc::clone(&self.requestor) as Arc<dyn Requestor>
    }

    fn event_source(&self, _config: &SyncConfig) -> Arc<dyn EventSource> {
        self.built.fetch_add(1, Ordering::SeqCst);
        Arc::clone(&self.source) as Arc<dyn EventSource>
    }

    fn management_api(&self, _config: &SyncConfig) -> Arc<dyn ManagementApi> {
        Arc::clone(&self.api) as Arc<dyn ManagementApi>
    }
}

pub async fn eventually(cond: impl Fn() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
