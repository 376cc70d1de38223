use log::{debug, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Mutex;
use tokio::sync::oneshot;

use super::frame::{self, MbapHeader, Request, ResponseBody, MODBUS_PROTOCOL_ID};
use crate::utils::error::ModbusError;

type Waiter = oneshot::Sender<Result<ResponseBody, ModbusError>>;

struct PendingTransaction {
    request: Request,
    waiter: Waiter,
}

/// Tracks in-flight requests by transaction id.
///
/// Ids are monotonically increasing 16-bit values that wrap at 65535 and are
/// unique among pending entries. The receive loop resolves entries as frames
/// arrive; a frame whose transaction id has no pending counterpart is dropped
/// without touching any other entry.
pub struct TransactionManager {
    pending: Mutex<HashMap<u16, PendingTransaction>>,
    next_id: AtomicU16,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU16::new(1),
        }
    }

    /// Allocate a transaction id for `request` and register a waiter for its
    /// response. Returns the request stamped with its id.
    pub fn register(
        &self,
        mut request: Request,
    ) -> Result<(Request, oneshot::Receiver<Result<ResponseBody, ModbusError>>), ModbusError>
    {
        let mut pending = self.pending.lock().map_err(|_| ModbusError::LockError)?;

        let mut id = self.next_id.fetch_add(1, Ordering::Relaxed);
        while pending.contains_key(&id) {
            id = self.next_id.fetch_add(1, Ordering::Relaxed);
        }

        request.transaction_id = id;
        let (tx, rx) = oneshot::channel();
        pending.insert(
            id,
            PendingTransaction {
                request: request.clone(),
                waiter: tx,
            },
        );
        Ok((request, rx))
    }

    /// Dispatch a received frame to its waiter, decoding the PDU against the
    /// stored request. Unmatched transaction ids are dropped silently.
    pub fn dispatch(&self, header: &MbapHeader, pdu: &[u8]) {
        let entry = match self.pending.lock() {
            Ok(mut pending) => pending.remove(&header.transaction_id),
            Err(_) => {
                warn!("⚠️  Pending transaction map poisoned, dropping frame");
                return;
            }
        };

        let Some(entry) = entry else {
            debug!(
                "📭 Dropping frame for unknown transaction {}",
                header.transaction_id
            );
            return;
        };

        let result = if header.protocol_id != MODBUS_PROTOCOL_ID {
            Err(ModbusError::Protocol(format!(
                "unexpected protocol id {}",
                header.protocol_id
            )))
        } else {
            frame::decode_response_pdu(&entry.request, pdu)
        };

        // The waiter may have timed out and gone away; nothing to do then.
        let _ = entry.waiter.send(result);
    }

    /// Forget a pending transaction. Used by the timeout path so a late
    /// response is treated as unmatched.
    pub fn remove(&self, transaction_id: u16) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&transaction_id);
        }
    }

    /// Fail every pending transaction. Called when the connection drops.
    pub fn fail_all(&self, reason: &str) {
        let drained: Vec<PendingTransaction> = match self.pending.lock() {
            Ok(mut pending) => pending.drain().map(|(_, entry)| entry).collect(),
            Err(_) => return,
        };
        if !drained.is_empty() {
            warn!(
                "❌ Failing {} pending transaction(s): {}",
                drained.len(),
                reason
            );
        }
        for entry in drained {
            let _ = entry
                .waiter
                .send(Err(ModbusError::ConnectionLost(reason.to_string())));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    #[cfg(test)]
    fn set_next_id(&self, id: u16) {
        self.next_id.store(id, Ordering::Relaxed);
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}
