use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;

use crate::errors::{GatewayError, GatewayResult};
use crate::models::{ConnectionSummary, Protocol, StatsResponse, VmConnectionCount};
use crate::splice::SpliceCommand;

/// Live state of one proxied connection. Owned by the registry; the splice
/// tasks hold a shared reference for activity/liveness updates.
pub struct ConnectionRecord {
    pub id: String,
    pub vm_id: String,
    pub protocol: Protocol,
    pub upstream: String,
    pub client: Option<SocketAddr>,
    pub started_at: DateTime<Utc>,
    last_activity: AtomicI64,
    alive: AtomicBool,
    control: UnboundedSender<SpliceCommand>,
}

impl ConnectionRecord {
    pub fn new(
        id: String,
        vm_id: String,
        protocol: Protocol,
        upstream: String,
        client: Option<SocketAddr>,
        control: UnboundedSender<SpliceCommand>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            vm_id,
            protocol,
            upstream,
            client,
            started_at: now,
            last_activity: AtomicI64::new(now.timestamp_millis()),
            alive: AtomicBool::new(true),
            control,
        }
    }

    pub fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Called on any client pong; revives the liveness flag.
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Relaxed);
        self.touch();
    }

    /// Clears the liveness flag and reports whether it was set. The heartbeat
    /// terminates connections whose flag was already clear.
    pub fn begin_probe(&self) -> bool {
        self.alive.swap(false, Ordering::Relaxed)
    }

    pub fn send_ping(&self) {
        let _ = self.control.send(SpliceCommand::Ping);
    }

    pub fn terminate(&self, code: u16, reason: &str) {
        let _ = self.control.send(SpliceCommand::Terminate {
            code,
            reason: reason.to_string(),
        });
    }

    pub fn send_text(&self, text: String) -> bool {
        self.control.send(SpliceCommand::SendText(text)).is_ok()
    }

    pub(crate) fn control_sender(&self) -> &UnboundedSender<SpliceCommand> {
        &self.control
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        let millis = self.last_activity.load(Ordering::Relaxed);
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or_else(Utc::now)
    }

    fn summary(&self) -> ConnectionSummary {
        ConnectionSummary {
            id: self.id.clone(),
            vm_id: self.vm_id.clone(),
            protocol: self.protocol,
            upstream: self.upstream.clone(),
            client: self.client.map(|addr| addr.to_string()),
            started_at: self.started_at,
            last_activity: self.last_activity(),
        }
    }
}

#[derive(Default)]
struct Inner {
    connections: HashMap<String, Arc<ConnectionRecord>>,
    by_vm: HashMap<String, HashSet<String>>,
    total: usize,
}

/// Global connection map plus the per-VM index, guarded by one coarse lock.
/// All operations are O(1)-ish; the byte pumps never touch this.
pub struct ConnectionRegistry {
    global_max: usize,
    per_vm_max: usize,
    counter: AtomicU64,
    inner: Mutex<Inner>,
}

impl ConnectionRegistry {
    pub fn new(global_max: usize, per_vm_max: usize) -> Self {
        Self {
            global_max,
            per_vm_max,
            counter: AtomicU64::new(0),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Check caps (global first, then per-VM) and reserve a slot. The
    /// reservation counts against both caps immediately so concurrent dials
    /// cannot oversubscribe; `unregister` releases it on any exit path.
    pub fn admit(&self, vm_id: &str) -> GatewayResult<String> {
        let mut inner = self.lock();
        if inner.total >= self.global_max {
            return Err(GatewayError::GlobalCapacity);
        }
        let slots = inner.by_vm.entry(vm_id.to_string()).or_default();
        if slots.len() >= self.per_vm_max {
            return Err(GatewayError::VmCapacity);
        }
        let id = format!(
            "{}_{}_{}",
            vm_id,
            self.counter.fetch_add(1, Ordering::Relaxed),
            Utc::now().timestamp_millis()
        );
        slots.insert(id.clone());
        inner.total += 1;
        Ok(id)
    }

    /// Attach the full record to a previously admitted id.
    pub fn register(&self, record: Arc<ConnectionRecord>) {
        let mut inner = self.lock();
        inner.connections.insert(record.id.clone(), record);
    }

    /// Release a connection id. Safe to call more than once; only the first
    /// call frees the slot.
    pub fn unregister(&self, vm_id: &str, id: &str) -> bool {
        let mut inner = self.lock();
        inner.connections.remove(id);
        let mut released = false;
        if let Some(slots) = inner.by_vm.get_mut(vm_id) {
            released = slots.remove(id);
            if slots.is_empty() {
                inner.by_vm.remove(vm_id);
            }
        }
        if released {
            inner.total -= 1;
        }
        released
    }

    pub fn count_by_vm(&self, vm_id: &str) -> usize {
        self.lock().by_vm.get(vm_id).map_or(0, HashSet::len)
    }

    pub fn total(&self) -> usize {
        self.lock().total
    }

    pub fn records(&self) -> Vec<Arc<ConnectionRecord>> {
        self.lock().connections.values().cloned().collect()
    }

    pub fn close_all_by_vm(&self, vm_id: &str, code: u16, reason: &str) {
        for record in self.records() {
            if record.vm_id == vm_id {
                record.terminate(code, reason);
            }
        }
    }

    pub fn close_all(&self, code: u16, reason: &str) {
        for record in self.records() {
            record.terminate(code, reason);
        }
    }

    pub fn snapshot(&self) -> StatsResponse {
        let inner = self.lock();
        let mut by_vm: Vec<VmConnectionCount> = inner
            .by_vm
            .iter()
            .map(|(vm_id, slots)| VmConnectionCount {
                vm_id: vm_id.clone(),
                connections: slots.len(),
            })
            .collect();
        by_vm.sort_by(|a, b| a.vm_id.cmp(&b.vm_id));
        let mut connections: Vec<ConnectionSummary> =
            inner.connections.values().map(|r| r.summary()).collect();
        connections.sort_by(|a, b| a.id.cmp(&b.id));
        StatsResponse {
            total: inner.total,
            by_vm,
            connections,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn record(registry: &ConnectionRegistry, vm: &str) -> (Arc<ConnectionRecord>, String) {
        let id = registry.admit(vm).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let record = Arc::new(ConnectionRecord::new(
            id.clone(),
            vm.to_string(),
            Protocol::Vnc,
            "10.0.0.7:5901".into(),
            None,
            tx,
        ));
        registry.register(record.clone());
        (record, id)
    }

    #[test]
    fn per_vm_cap_is_enforced() {
        let registry = ConnectionRegistry::new(100, 2);
        let _a = record(&registry, "vm-1");
        let _b = record(&registry, "vm-1");
        assert!(matches!(
            registry.admit("vm-1"),
            Err(GatewayError::VmCapacity)
        ));
        // Other VMs are unaffected.
        assert!(registry.admit("vm-2").is_ok());
    }

    #[test]
    fn global_cap_is_checked_first() {
        let registry = ConnectionRegistry::new(1, 20);
        let _a = record(&registry, "vm-1");
        assert!(matches!(
            registry.admit("vm-2"),
            Err(GatewayError::GlobalCapacity)
        ));
    }

    #[test]
    fn connection_ids_are_unique() {
        let registry = ConnectionRegistry::new(100, 20);
        let a = registry.admit("vm-1").unwrap();
        let b = registry.admit("vm-1").unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("vm-1_"));
    }

    #[test]
    fn unregister_twice_is_a_noop() {
        let registry = ConnectionRegistry::new(100, 20);
        let (_record, id) = record(&registry, "vm-1");
        assert_eq!(registry.count_by_vm("vm-1"), 1);
        assert!(registry.unregister("vm-1", &id));
        assert!(!registry.unregister("vm-1", &id));
        assert_eq!(registry.total(), 0);
        // Empty per-VM sets are dropped entirely.
        assert_eq!(registry.count_by_vm("vm-1"), 0);
        assert!(registry.snapshot().by_vm.is_empty());
    }

    #[test]
    fn reservation_counts_before_registration() {
        let registry = ConnectionRegistry::new(100, 1);
        let id = registry.admit("vm-1").unwrap();
        // Still dialling, no record registered yet, but the slot is taken.
        assert!(matches!(
            registry.admit("vm-1"),
            Err(GatewayError::VmCapacity)
        ));
        registry.unregister("vm-1", &id);
        assert!(registry.admit("vm-1").is_ok());
    }

    #[tokio::test]
    async fn close_all_by_vm_only_touches_that_vm() {
        let registry = ConnectionRegistry::new(100, 20);
        let id_a = registry.admit("vm-1").unwrap();
        let id_b = registry.admit("vm-2").unwrap();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        registry.register(Arc::new(ConnectionRecord::new(
            id_a,
            "vm-1".into(),
            Protocol::Vnc,
            "10.0.0.7:5901".into(),
            None,
            tx_a,
        )));
        registry.register(Arc::new(ConnectionRecord::new(
            id_b,
            "vm-2".into(),
            Protocol::Vnc,
            "10.0.0.8:5901".into(),
            None,
            tx_b,
        )));

        registry.close_all_by_vm("vm-1", 1000, "operator request");
        assert!(matches!(
            rx_a.recv().await,
            Some(SpliceCommand::Terminate { code: 1000, .. })
        ));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_all_reaches_every_record() {
        let registry = ConnectionRegistry::new(100, 20);
        let id = registry.admit("vm-1").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let record = Arc::new(ConnectionRecord::new(
            id,
            "vm-1".into(),
            Protocol::Spice,
            "10.0.0.7:5902".into(),
            None,
            tx,
        ));
        registry.register(record);
        registry.close_all(1001, "server shutting down");
        match rx.recv().await {
            Some(SpliceCommand::Terminate { code, reason }) => {
                assert_eq!(code, 1001);
                assert_eq!(reason, "server shutting down");
            }
            other => panic!("expected terminate command, got {other:?}"),
        }
    }
}
