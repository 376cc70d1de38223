use chrono::{DateTime, Utc};
use log::{info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use uuid::Uuid;

use crate::modbus::client::{validate_range, ModbusClient};
use crate::modbus::frame::RegisterBank;
use crate::modbus::registers::BankValues;
use crate::utils::error::ModbusError;

/// One poll cycle's outcome, published to the observer channel.
#[derive(Debug)]
pub struct WatchUpdate {
    pub watch_id: Uuid,
    pub bank: RegisterBank,
    pub start: u16,
    pub count: u16,
    pub timestamp: DateTime<Utc>,
    pub result: Result<BankValues, ModbusError>,
}

/// Handle returned by `start_watch`. Each watch carries its own cancellation
/// flag, so stopping one never affects another.
#[derive(Debug, Clone)]
pub struct WatchHandle {
    id: Uuid,
    bank: RegisterBank,
    start: u16,
    count: u16,
    active: Arc<AtomicBool>,
}

impl WatchHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn bank(&self) -> RegisterBank {
        self.bank
    }

    pub fn range(&self) -> (u16, u16) {
        (self.start, self.count)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

type WatchRegistry = Arc<Mutex<HashMap<Uuid, Arc<AtomicBool>>>>;

/// Periodic read orchestrator.
///
/// Every watch runs on its own timer task and publishes the latest values to
/// one shared mpsc channel. Ticks are non-reentrant: a cycle that has not
/// resolved by the next tick makes the timer skip, never queue.
pub struct PollService {
    client: Arc<ModbusClient>,
    watches: WatchRegistry,
    updates_tx: mpsc::Sender<WatchUpdate>,
}

impl PollService {
    pub fn new(client: Arc<ModbusClient>, buffer: usize) -> (Self, mpsc::Receiver<WatchUpdate>) {
        let (updates_tx, updates_rx) = mpsc::channel(buffer.max(1));
        let service = Self {
            client,
            watches: Arc::new(Mutex::new(HashMap::new())),
            updates_tx,
        };
        (service, updates_rx)
    }

    /// Register a watch and start polling it at `every` cadence. The first
    /// read happens immediately.
    pub fn start_watch(
        &self,
        bank: RegisterBank,
        start: u16,
        count: u16,
        every: Duration,
    ) -> Result<WatchHandle, ModbusError> {
        if every.is_zero() {
            return Err(ModbusError::Validation(
                "poll interval must be positive".to_string(),
            ));
        }
        validate_range(bank, start, count)?;

        let id = Uuid::new_v4();
        let active = Arc::new(AtomicBool::new(true));
        {
            let mut watches = self.watches.lock().map_err(|_| ModbusError::LockError)?;
            watches.insert(id, Arc::clone(&active));
        }

        info!(
            "👁️  Watch {} started: {} {}..{} every {:?}",
            id,
            bank,
            start,
            start as u32 + count as u32 - 1,
            every
        );

        tokio::spawn(poll_loop(
            Arc::clone(&self.client),
            self.updates_tx.clone(),
            Arc::clone(&self.watches),
            id,
            bank,
            start,
            count,
            every,
            Arc::clone(&active),
        ));

        Ok(WatchHandle {
            id,
            bank,
            start,
            count,
            active,
        })
    }

    /// Disable a watch. Effective before its next tick: no further request is
    /// issued once this returns, and an in-flight cycle's result is discarded.
    pub fn stop_watch(&self, handle: &WatchHandle) {
        handle.active.store(false, Ordering::SeqCst);
        if let Ok(mut watches) = self.watches.lock() {
            watches.remove(&handle.id);
        }
        info!("🛑 Watch {} stopped", handle.id);
    }

    /// Disable every watch, e.g. before disconnecting the client.
    pub fn stop_all(&self) {
        if let Ok(mut watches) = self.watches.lock() {
            for (id, active) in watches.drain() {
                active.store(false, Ordering::SeqCst);
                info!("🛑 Watch {} stopped", id);
            }
        }
    }

    pub fn active_watches(&self) -> usize {
        self.watches.lock().map(|w| w.len()).unwrap_or(0)
    }
}

#[allow(clippy::too_many_arguments)]
async fn poll_loop(
    client: Arc<ModbusClient>,
    updates: mpsc::Sender<WatchUpdate>,
    watches: WatchRegistry,
    id: Uuid,
    bank: RegisterBank,
    start: u16,
    count: u16,
    every: Duration,
    active: Arc<AtomicBool>,
) {
    let mut ticker = interval(every);
    // Skip rather than queue: a slow cycle must not pile up extra requests.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        if !active.load(Ordering::SeqCst) {
            break;
        }

        let result = client.read_bank(bank, start, count).await;

        // Stopped while the request was in flight: discard the result.
        if !active.load(Ordering::SeqCst) {
            break;
        }

        let fatal = matches!(&result, Err(e) if e.is_connection_fatal());
        if let Err(e) = &result {
            warn!("❌ Watch {} read failed: {}", id, e);
        }

        let update = WatchUpdate {
            watch_id: id,
            bank,
            start,
            count,
            timestamp: Utc::now(),
            result,
        };
        if updates.send(update).await.is_err() {
            // Observer is gone; polling for nobody is pointless.
            break;
        }

        if fatal {
            warn!("🔌 Watch {} disabled: connection lost", id);
            break;
        }
    }

    active.store(false, Ordering::SeqCst);
    if let Ok(mut watches) = watches.lock() {
        watches.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::registers::{BankLayout, RegisterStore};
    use crate::modbus::transport;
    use crate::services::server_service::build_reply;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;

    /// Modbus server that counts every request frame it serves.
    async fn spawn_counting_server() -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&requests);

        tokio::spawn(async move {
            let store = Arc::new(Mutex::new(RegisterStore::new(&BankLayout::default())));
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let store = Arc::clone(&store);
                let counter = Arc::clone(&counter);
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.into_split();
                    while let Ok((header, pdu)) = transport::read_frame(&mut reader).await {
                        counter.fetch_add(1, Ordering::SeqCst);
                        if let Some(reply) = build_reply(&header, &pdu, &store) {
                            if transport::write_frame(&mut writer, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                });
            }
        });

        (addr, requests)
    }

    async fn connect(addr: SocketAddr) -> Arc<ModbusClient> {
        Arc::new(
            ModbusClient::connect("127.0.0.1", addr.port(), 1, Duration::from_secs(1))
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_watch_publishes_periodic_updates() {
        let (addr, _requests) = spawn_counting_server().await;
        let client = connect(addr).await;
        let (service, mut updates) = PollService::new(Arc::clone(&client), 16);

        let handle = service
            .start_watch(
                RegisterBank::HoldingRegisters,
                0,
                5,
                Duration::from_millis(20),
            )
            .unwrap();

        for _ in 0..3 {
            let update = updates.recv().await.unwrap();
            assert_eq!(update.watch_id, handle.id());
            assert_eq!(update.bank, RegisterBank::HoldingRegisters);
            let values = update.result.unwrap();
            assert_eq!(values.len(), 5);
        }

        service.stop_watch(&handle);
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_stop_watch_prevents_further_requests_on_the_wire() {
        let (addr, requests) = spawn_counting_server().await;
        let client = connect(addr).await;
        let (service, mut updates) = PollService::new(Arc::clone(&client), 16);

        let handle = service
            .start_watch(RegisterBank::Coils, 0, 4, Duration::from_millis(20))
            .unwrap();
        let _ = updates.recv().await.unwrap();
        let _ = updates.recv().await.unwrap();

        service.stop_watch(&handle);
        assert!(!handle.is_active());

        // Let an in-flight cycle (if any) drain, then the count must freeze.
        tokio::time::sleep(Duration::from_millis(60)).await;
        let frozen = requests.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(requests.load(Ordering::SeqCst), frozen);

        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_watches_cancel_independently() {
        let (addr, _requests) = spawn_counting_server().await;
        let client = connect(addr).await;
        let (service, mut updates) = PollService::new(Arc::clone(&client), 64);

        let coils = service
            .start_watch(RegisterBank::Coils, 0, 2, Duration::from_millis(20))
            .unwrap();
        let registers = service
            .start_watch(
                RegisterBank::InputRegisters,
                0,
                3,
                Duration::from_millis(20),
            )
            .unwrap();
        assert_eq!(service.active_watches(), 2);

        service.stop_watch(&coils);
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Drain and confirm the surviving watch still reports.
        let mut register_updates = 0;
        while let Ok(update) = updates.try_recv() {
            if update.watch_id == registers.id() {
                register_updates += 1;
            }
        }
        assert!(register_updates > 0);
        assert!(registers.is_active());
        assert_eq!(service.active_watches(), 1);

        service.stop_all();
        assert_eq!(service.active_watches(), 0);
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_invalid_watch_parameters_rejected() {
        let (addr, _requests) = spawn_counting_server().await;
        let client = connect(addr).await;
        let (service, _updates) = PollService::new(Arc::clone(&client), 4);

        assert!(matches!(
            service.start_watch(RegisterBank::Coils, 0, 1, Duration::ZERO),
            Err(ModbusError::Validation(_))
        ));
        assert!(matches!(
            service.start_watch(RegisterBank::Coils, 0, 0, Duration::from_millis(10)),
            Err(ModbusError::Validation(_))
        ));
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_watch_disabled_on_connection_loss() {
        let (addr, _requests) = spawn_counting_server().await;
        let client = connect(addr).await;
        let (service, mut updates) = PollService::new(Arc::clone(&client), 16);

        let handle = service
            .start_watch(RegisterBank::Coils, 0, 1, Duration::from_millis(20))
            .unwrap();
        let first = updates.recv().await.unwrap();
        assert!(first.result.is_ok());

        client.disconnect().await;

        // The next cycle observes the loss, publishes it and disables itself.
        let mut saw_loss = false;
        while let Some(update) = updates.recv().await {
            if update.result.is_err() {
                saw_loss = true;
                break;
            }
        }
        assert!(saw_loss);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_active());
        assert_eq!(service.active_watches(), 0);
    }
}
