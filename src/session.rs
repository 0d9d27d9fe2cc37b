use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::errors::GatewayResult;
use crate::models::{ConnectTarget, VmInfo};

#[derive(Clone, Debug)]
struct CachedEntry {
    target: ConnectTarget,
    #[allow(dead_code)]
    cached_at: DateTime<Utc>,
}

/// Server-side login state. Holds the upstream token (never sent to the
/// browser) and the per-VM connection-info cache.
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub upstream_token: String,
    pub vms: Vec<VmInfo>,
    pub created_at: DateTime<Utc>,
    credentials: Mutex<HashMap<String, CachedEntry>>,
}

impl Session {
    pub fn new(id: String, user_id: String, upstream_token: String, vms: Vec<VmInfo>) -> Self {
        Self {
            id,
            user_id,
            upstream_token,
            vms,
            created_at: Utc::now(),
            credentials: Mutex::new(HashMap::new()),
        }
    }

    /// Cache-or-fetch of connection info for one VM.
    ///
    /// The cache lock is held across the fetch so concurrent upgrades for the
    /// same session cannot race two upstream calls: the management API hands
    /// out a different password on every call, and the one already given to
    /// the browser is the only one the display server will accept.
    pub async fn connect_target<F>(&self, vm_id: &str, fetch: F) -> GatewayResult<ConnectTarget>
    where
        F: Future<Output = GatewayResult<ConnectTarget>>,
    {
        let mut cache = self.credentials.lock().await;
        if let Some(entry) = cache.get(vm_id) {
            return Ok(entry.target.clone());
        }
        let target = fetch.await?;
        cache.insert(
            vm_id.to_string(),
            CachedEntry {
                target: target.clone(),
                cached_at: Utc::now(),
            },
        );
        Ok(target)
    }

    async fn snapshot_credentials(&self) -> HashMap<String, CachedEntry> {
        self.credentials.lock().await.clone()
    }
}

/// In-process session map. Nothing survives a restart; clients re-authenticate.
#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, session: Session) -> Arc<Session> {
        let session = Arc::new(session);
        self.sessions.insert(session.id.clone(), session.clone());
        session
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    /// Re-key a session under a fresh id, carrying the payload (inventory and
    /// credential cache) over unchanged. The new id is live before the old
    /// one disappears.
    pub async fn replace(&self, old_id: &str, new_id: &str) -> Option<Arc<Session>> {
        let old = self.get(old_id)?;
        let credentials = old.snapshot_credentials().await;
        let fresh = Arc::new(Session {
            id: new_id.to_string(),
            user_id: old.user_id.clone(),
            upstream_token: old.upstream_token.clone(),
            vms: old.vms.clone(),
            created_at: old.created_at,
            credentials: Mutex::new(credentials),
        });
        self.sessions.insert(new_id.to_string(), fresh.clone());
        self.sessions.remove(old_id);
        Some(fresh)
    }

    pub fn clear(&self) {
        self.sessions.clear();
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::GatewayError;
    use crate::models::VmType;

    fn sample_vms() -> Vec<VmInfo> {
        vec![VmInfo {
            id: "vm-1".into(),
            name: "dev".into(),
            status: "running".into(),
            vm_type: VmType::Standalone,
        }]
    }

    #[tokio::test]
    async fn put_get_remove() {
        let store = SessionStore::new();
        store.put(Session::new(
            "s1".into(),
            "alice".into(),
            "tok".into(),
            sample_vms(),
        ));
        assert!(store.get("s1").is_some());
        assert!(store.remove("s1").is_some());
        assert!(store.get("s1").is_none());
        assert!(store.remove("s1").is_none());
    }

    #[tokio::test]
    async fn connect_target_fetches_once() {
        let session = Session::new("s1".into(), "alice".into(), "tok".into(), sample_vms());
        let first = session
            .connect_target("vm-1", async {
                Ok(ConnectTarget {
                    host: "10.0.0.7".into(),
                    port: 5901,
                    password: "p1".into(),
                })
            })
            .await
            .unwrap();
        // A second resolution must not consult the fetch path at all.
        let second = session
            .connect_target("vm-1", async {
                Err::<ConnectTarget, _>(GatewayError::Internal("should not be called".into()))
            })
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(second.password, "p1");
    }

    #[tokio::test]
    async fn replace_preserves_payload_and_cache() {
        let store = SessionStore::new();
        let session = store.put(Session::new(
            "old".into(),
            "alice".into(),
            "tok".into(),
            sample_vms(),
        ));
        session
            .connect_target("vm-1", async {
                Ok(ConnectTarget {
                    host: "10.0.0.7".into(),
                    port: 5901,
                    password: "stable".into(),
                })
            })
            .await
            .unwrap();

        let fresh = store.replace("old", "new").await.unwrap();
        assert!(store.get("old").is_none());
        assert_eq!(fresh.user_id, "alice");
        assert_eq!(fresh.upstream_token, "tok");
        assert_eq!(fresh.vms, sample_vms());

        let cached = fresh
            .connect_target("vm-1", async {
                Err::<ConnectTarget, _>(GatewayError::Internal("should not be called".into()))
            })
            .await
            .unwrap();
        assert_eq!(cached.password, "stable");
    }

    #[tokio::test]
    async fn replace_of_missing_session_is_none() {
        let store = SessionStore::new();
        assert!(store.replace("ghost", "new").await.is_none());
    }
}
