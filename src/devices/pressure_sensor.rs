use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::modbus::frame::RegisterBank;
use crate::modbus::registers::{BankLayout, BankValues, RegisterStore};
use crate::utils::error::ModbusError;

/// Simulated PT-100 pressure sensor.
///
/// Owns the register store the server answers from: 10 coils, 10 discrete
/// inputs, 20 holding registers and 20 input registers, all seeded with
/// random values at startup. Input register 0 is the pressure channel.
pub struct PressureSensor {
    name: String,
    store: Arc<Mutex<RegisterStore>>,
}

impl PressureSensor {
    pub fn new(layout: &BankLayout) -> Self {
        let store = RegisterStore::randomized(layout, &mut rand::thread_rng());
        info!(
            "🌡️  Virtual device 'PT-100' initialized: {} coils, {} discrete inputs, {} holding registers, {} input registers",
            layout.coils, layout.discrete_inputs, layout.holding_registers, layout.input_registers
        );
        Self {
            name: "PT-100".to_string(),
            store: Arc::new(Mutex::new(store)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared handle for the server's connection tasks. The mutex is the
    /// sole guard between drift ticks and concurrent client requests.
    pub fn store(&self) -> Arc<Mutex<RegisterStore>> {
        Arc::clone(&self.store)
    }

    /// Current value of the pressure channel (input register 0).
    pub fn pressure(&self) -> Result<u16, ModbusError> {
        let store = self.store.lock().map_err(|_| ModbusError::LockError)?;
        match store.read(RegisterBank::InputRegisters, 0, 1) {
            Ok(BankValues::Words(words)) => Ok(words[0]),
            _ => Err(ModbusError::Validation(
                "device has no input register 0".to_string(),
            )),
        }
    }

    /// Start the periodic drift task that mutates register values to mimic a
    /// live device. The task takes the store lock for each tick only.
    pub fn spawn_drift(&self, tick: Duration) -> DriftHandle {
        let store = Arc::clone(&self.store);
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);

        info!("🔄 Device drift started: tick every {:?}", tick);
        let task = tokio::spawn(async move {
            let mut ticker = interval(tick);
            loop {
                ticker.tick().await;
                if !flag.load(Ordering::SeqCst) {
                    break;
                }
                match store.lock() {
                    Ok(mut store) => store.drift(&mut rand::thread_rng()),
                    Err(_) => {
                        warn!("⚠️  Register store lock poisoned, drift stopped");
                        break;
                    }
                }
            }
        });

        DriftHandle { running, task }
    }
}

pub struct DriftHandle {
    running: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl DriftHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.task.abort();
    }
}

impl Drop for DriftHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::registers::DRIFT_VALUE_MAX;

    #[test]
    fn test_new_sensor_has_randomized_banks() {
        let sensor = PressureSensor::new(&BankLayout::default());
        let store = sensor.store();
        let store = store.lock().unwrap();
        match store.read(RegisterBank::InputRegisters, 0, 20).unwrap() {
            BankValues::Words(words) => {
                assert_eq!(words.len(), 20);
                assert!(words.iter().all(|w| *w <= DRIFT_VALUE_MAX));
            }
            other => panic!("expected words, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_drift_task_stops_on_handle_stop() {
        let sensor = PressureSensor::new(&BankLayout::default());
        let handle = sensor.spawn_drift(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.stop();
        // The store stays usable after the task is gone.
        assert!(sensor.pressure().is_ok());
    }
}
