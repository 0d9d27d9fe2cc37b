//! Translates a verified grant plus a VM id into the (host, port, password)
//! tuple a splice needs.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::sync::Arc;

use crate::errors::{GatewayError, GatewayResult};
use crate::models::{ConnectTarget, Protocol, SpiceRendering};
use crate::ocloud::ManagementApi;
use crate::session::SessionStore;
use crate::token::Grant;

pub struct TargetResolver {
    api: Arc<dyn ManagementApi>,
    sessions: Arc<SessionStore>,
}

impl TargetResolver {
    pub fn new(api: Arc<dyn ManagementApi>, sessions: Arc<SessionStore>) -> Self {
        Self { api, sessions }
    }

    /// Resolve connection info for `vm_id`.
    ///
    /// Display grants carry their own upstream token and always fetch fresh
    /// info. Session grants go through the per-VM cache: the first resolution
    /// stores the tuple and every later call returns it verbatim, because the
    /// password the upstream mints is single-use and already in the client's
    /// hands.
    pub async fn resolve(
        &self,
        grant: &Grant,
        vm_id: &str,
        protocol: Protocol,
        rendering: &SpiceRendering,
    ) -> GatewayResult<ConnectTarget> {
        match grant {
            Grant::Display {
                vm_id: granted_vm,
                upstream_token,
            } => {
                if granted_vm != vm_id {
                    return Err(GatewayError::Forbidden);
                }
                self.fetch(upstream_token, vm_id, protocol, rendering).await
            }
            Grant::UserSession { session_id, .. } => {
                let session = self
                    .sessions
                    .get(session_id)
                    .ok_or(GatewayError::SessionExpired)?;
                session
                    .connect_target(
                        vm_id,
                        self.fetch(&session.upstream_token, vm_id, protocol, rendering),
                    )
                    .await
            }
        }
    }

    async fn fetch(
        &self,
        token: &str,
        vm_id: &str,
        protocol: Protocol,
        rendering: &SpiceRendering,
    ) -> GatewayResult<ConnectTarget> {
        match protocol {
            Protocol::Vnc => {
                let info = self.api.vm_connection_info(token, vm_id).await?;
                let ports = self.api.vm_port(token, vm_id).await?;
                let encoded = self.api.vnc_password(token, vm_id).await?;
                Ok(ConnectTarget {
                    host: info.host_ip,
                    port: ports.vnc_port,
                    password: decode_password(&encoded)?,
                })
            }
            Protocol::Spice => {
                let info = self
                    .api
                    .spice_connection_info(token, vm_id, rendering)
                    .await?;
                Ok(ConnectTarget {
                    host: info.host_ip,
                    port: info.spice_port,
                    password: info.password,
                })
            }
        }
    }
}

/// The VNC password endpoint base64-wraps the password; unwrap it here, once,
/// before it reaches the cache.
fn decode_password(encoded: &str) -> GatewayResult<String> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| GatewayError::Internal(format!("upstream password is not base64: {e}")))?;
    String::from_utf8(bytes)
        .map_err(|e| GatewayError::Internal(format!("upstream password is not utf-8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocloud::{LoginData, SpiceConnectionInfo, VmConnectionInfo, VmPorts};
    use crate::session::{Session, SessionStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fake management API whose password endpoint is deliberately
    /// non-idempotent: p1, then p2, then p3...
    #[derive(Default)]
    struct FakeApi {
        password_calls: AtomicUsize,
        info_calls: AtomicUsize,
    }

    #[async_trait]
    impl ManagementApi for FakeApi {
        async fn login(&self, _username: &str, _password: &str) -> GatewayResult<LoginData> {
            unimplemented!("not used by the resolver")
        }

        async fn vm_connection_info(
            &self,
            _token: &str,
            _vm_id: &str,
        ) -> GatewayResult<VmConnectionInfo> {
            self.info_calls.fetch_add(1, Ordering::SeqCst);
            Ok(VmConnectionInfo {
                host_ip: "10.0.0.7".into(),
            })
        }

        async fn vm_port(&self, _token: &str, _vm_id: &str) -> GatewayResult<VmPorts> {
            Ok(VmPorts {
                vnc_port: 5901,
                spice_port: 5902,
            })
        }

        async fn vnc_password(&self, _token: &str, _vm_id: &str) -> GatewayResult<String> {
            let n = self.password_calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(STANDARD.encode(format!("p{n}")))
        }

        async fn spice_connection_info(
            &self,
            _token: &str,
            _vm_id: &str,
            _rendering: &SpiceRendering,
        ) -> GatewayResult<SpiceConnectionInfo> {
            Ok(SpiceConnectionInfo {
                host_ip: "10.0.0.7".into(),
                spice_port: 5902,
                password: "plain".into(),
            })
        }
    }

    fn setup() -> (Arc<FakeApi>, Arc<SessionStore>, TargetResolver) {
        let api = Arc::new(FakeApi::default());
        let sessions = Arc::new(SessionStore::new());
        let resolver = TargetResolver::new(api.clone(), sessions.clone());
        (api, sessions, resolver)
    }

    fn session_grant(sessions: &SessionStore) -> Grant {
        sessions.put(Session::new(
            "s1".into(),
            "alice".into(),
            "upstream-tok".into(),
            Vec::new(),
        ));
        Grant::UserSession {
            session_id: "s1".into(),
            user_id: "alice".into(),
        }
    }

    #[tokio::test]
    async fn session_grant_returns_a_stable_password() {
        let (api, sessions, resolver) = setup();
        let grant = session_grant(&sessions);

        let first = resolver
            .resolve(&grant, "vm-1", Protocol::Vnc, &SpiceRendering::default())
            .await
            .unwrap();
        let second = resolver
            .resolve(&grant, "vm-1", Protocol::Vnc, &SpiceRendering::default())
            .await
            .unwrap();

        // Decoded exactly once, cached thereafter.
        assert_eq!(first.password, "p1");
        assert_eq!(second.password, "p1");
        assert_eq!(api.password_calls.load(Ordering::SeqCst), 1);
        assert_eq!(api.info_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn display_grant_bypasses_the_cache() {
        let (api, _sessions, resolver) = setup();
        let grant = Grant::Display {
            vm_id: "vm-1".into(),
            upstream_token: "short-tok".into(),
        };

        let first = resolver
            .resolve(&grant, "vm-1", Protocol::Vnc, &SpiceRendering::default())
            .await
            .unwrap();
        let second = resolver
            .resolve(&grant, "vm-1", Protocol::Vnc, &SpiceRendering::default())
            .await
            .unwrap();

        assert_eq!(first.password, "p1");
        assert_eq!(second.password, "p2");
        assert_eq!(api.password_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn display_grant_for_another_vm_is_forbidden() {
        let (_api, _sessions, resolver) = setup();
        let grant = Grant::Display {
            vm_id: "vm-1".into(),
            upstream_token: "short-tok".into(),
        };
        assert!(matches!(
            resolver
                .resolve(&grant, "vm-2", Protocol::Vnc, &SpiceRendering::default())
                .await,
            Err(GatewayError::Forbidden)
        ));
    }

    #[tokio::test]
    async fn missing_session_is_expired() {
        let (_api, _sessions, resolver) = setup();
        let grant = Grant::UserSession {
            session_id: "ghost".into(),
            user_id: "alice".into(),
        };
        assert!(matches!(
            resolver
                .resolve(&grant, "vm-1", Protocol::Vnc, &SpiceRendering::default())
                .await,
            Err(GatewayError::SessionExpired)
        ));
    }

    #[tokio::test]
    async fn spice_password_arrives_plain() {
        let (_api, sessions, resolver) = setup();
        let grant = session_grant(&sessions);
        let target = resolver
            .resolve(&grant, "vm-1", Protocol::Spice, &SpiceRendering::default())
            .await
            .unwrap();
        assert_eq!(target.port, 5902);
        assert_eq!(target.password, "plain");
    }

    #[test]
    fn base64_round_trip() {
        let encoded = STANDARD.encode("pa55");
        assert_eq!(decode_password(&encoded).unwrap(), "pa55");
        assert!(decode_password("!!not-base64!!").is_err());
    }
}
