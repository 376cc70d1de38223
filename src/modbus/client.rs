use async_trait::async_trait;
use log::{error, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::frame::{
    RegisterBank, Request, ResponseBody, MAX_BIT_COUNT, MAX_WORD_COUNT,
};
use super::registers::BankValues;
use super::transaction::TransactionManager;
use super::transport;
use crate::utils::error::ModbusError;

/// Check a caller-supplied address range before any network I/O.
pub fn validate_range(bank: RegisterBank, start: u16, count: u16) -> Result<(), ModbusError> {
    if count == 0 {
        return Err(ModbusError::Validation(
            "count must be at least 1".to_string(),
        ));
    }
    let max = if bank.is_bit_bank() {
        MAX_BIT_COUNT
    } else {
        MAX_WORD_COUNT
    };
    if count > max {
        return Err(ModbusError::Validation(format!(
            "count {} exceeds protocol limit {} for {}",
            count, max, bank
        )));
    }
    if start as u32 + count as u32 - 1 > u16::MAX as u32 {
        return Err(ModbusError::Validation(format!(
            "range {}..{} exceeds the 16-bit address space",
            start,
            start as u32 + count as u32 - 1
        )));
    }
    Ok(())
}

#[async_trait]
pub trait ModbusClientTrait: Send + Sync {
    async fn read_coils(&self, start: u16, count: u16) -> Result<Vec<bool>, ModbusError>;

    async fn read_discrete_inputs(&self, start: u16, count: u16)
        -> Result<Vec<bool>, ModbusError>;

    async fn read_holding_registers(
        &self,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, ModbusError>;

    async fn read_input_registers(&self, start: u16, count: u16)
        -> Result<Vec<u16>, ModbusError>;

    async fn write_single_coil(&self, address: u16, value: bool) -> Result<(), ModbusError>;

    /// Takes the value as u32 so out-of-range input from forms is rejected
    /// locally instead of being truncated onto the wire.
    async fn write_single_register(&self, address: u16, value: u32) -> Result<(), ModbusError>;
}

/// Modbus TCP client: one connection shared by any number of caller tasks.
///
/// A single background task owns the read half and dispatches frames to the
/// transaction manager; writes are serialized through a mutex on the write
/// half. There is no automatic reconnection: once the connection is lost the
/// caller must connect again explicitly.
pub struct ModbusClient {
    peer: String,
    unit_id: u8,
    request_timeout: Duration,
    transactions: Arc<TransactionManager>,
    writer: Mutex<OwnedWriteHalf>,
    connected: Arc<AtomicBool>,
    reader_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ModbusClient {
    pub async fn connect(
        host: &str,
        port: u16,
        unit_id: u8,
        request_timeout: Duration,
    ) -> Result<Self, ModbusError> {
        let peer = format!("{}:{}", host, port);
        info!("🔌 Connecting to Modbus TCP server at {}", peer);

        let stream = TcpStream::connect(&peer).await.map_err(|e| {
            error!("❌ Failed to connect to {}: {}", peer, e);
            ModbusError::ConnectRefused(format!("{}: {}", peer, e))
        })?;
        let _ = stream.set_nodelay(true);

        let (read_half, write_half) = stream.into_split();
        let transactions = Arc::new(TransactionManager::new());
        let connected = Arc::new(AtomicBool::new(true));

        let reader_task = tokio::spawn(receive_loop(
            read_half,
            Arc::clone(&transactions),
            Arc::clone(&connected),
        ));

        info!("✅ Connected to {} (unit {})", peer, unit_id);
        Ok(Self {
            peer,
            unit_id,
            request_timeout,
            transactions,
            writer: Mutex::new(write_half),
            connected,
            reader_task: std::sync::Mutex::new(Some(reader_task)),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Close the connection and fail everything still pending. Watches
    /// polling through this client observe the loss on their next request.
    pub async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.transactions.fail_all("disconnected by caller");
        }
        if let Ok(mut guard) = self.reader_task.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
        use tokio::io::AsyncWriteExt;
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        info!("✅ Connection to {} closed gracefully", self.peer);
    }

    /// Generic read used by the polling orchestrator.
    pub async fn read_bank(
        &self,
        bank: RegisterBank,
        start: u16,
        count: u16,
    ) -> Result<BankValues, ModbusError> {
        validate_range(bank, start, count)?;
        let request = Request::read(self.unit_id, bank, start, count);
        match self.execute(request).await? {
            ResponseBody::Bits(bits) => Ok(BankValues::Bits(bits)),
            ResponseBody::Words(words) => Ok(BankValues::Words(words)),
            ResponseBody::Echo { .. } => Err(ModbusError::Protocol(
                "write echo received for a read request".to_string(),
            )),
        }
    }

    async fn execute(&self, request: Request) -> Result<ResponseBody, ModbusError> {
        if !self.is_connected() {
            return Err(ModbusError::ConnectionLost("not connected".to_string()));
        }

        let (request, response_rx) = self.transactions.register(request)?;
        let frame = request.encode();

        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = transport::write_frame(&mut *writer, &frame).await {
                self.transactions.remove(request.transaction_id);
                if self.connected.swap(false, Ordering::SeqCst) {
                    self.transactions.fail_all("write failed");
                }
                return Err(e);
            }
        }

        match timeout(self.request_timeout, response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ModbusError::ConnectionLost(
                "receive loop terminated".to_string(),
            )),
            Err(_) => {
                // Forget the transaction so a late reply is dropped as unmatched.
                self.transactions.remove(request.transaction_id);
                Err(ModbusError::Timeout)
            }
        }
    }
}

async fn receive_loop(
    mut reader: OwnedReadHalf,
    transactions: Arc<TransactionManager>,
    connected: Arc<AtomicBool>,
) {
    loop {
        match transport::read_frame(&mut reader).await {
            Ok((header, pdu)) => transactions.dispatch(&header, &pdu),
            Err(e) => {
                if connected.swap(false, Ordering::SeqCst) {
                    info!("🔌 Connection closed by peer: {}", e);
                    transactions.fail_all(&e.to_string());
                }
                break;
            }
        }
    }
}

impl Drop for ModbusClient {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.reader_task.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

#[async_trait]
impl ModbusClientTrait for ModbusClient {
    async fn read_coils(&self, start: u16, count: u16) -> Result<Vec<bool>, ModbusError> {
        match self.read_bank(RegisterBank::Coils, start, count).await? {
            BankValues::Bits(bits) => Ok(bits),
            BankValues::Words(_) => Err(ModbusError::Protocol(
                "word payload for a bit read".to_string(),
            )),
        }
    }

    async fn read_discrete_inputs(
        &self,
        start: u16,
        count: u16,
    ) -> Result<Vec<bool>, ModbusError> {
        match self
            .read_bank(RegisterBank::DiscreteInputs, start, count)
            .await?
        {
            BankValues::Bits(bits) => Ok(bits),
            BankValues::Words(_) => Err(ModbusError::Protocol(
                "word payload for a bit read".to_string(),
            )),
        }
    }

    async fn read_holding_registers(
        &self,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        match self
            .read_bank(RegisterBank::HoldingRegisters, start, count)
            .await?
        {
            BankValues::Words(words) => Ok(words),
            BankValues::Bits(_) => Err(ModbusError::Protocol(
                "bit payload for a register read".to_string(),
            )),
        }
    }

    async fn read_input_registers(
        &self,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        match self
            .read_bank(RegisterBank::InputRegisters, start, count)
            .await?
        {
            BankValues::Words(words) => Ok(words),
            BankValues::Bits(_) => Err(ModbusError::Protocol(
                "bit payload for a register read".to_string(),
            )),
        }
    }

    async fn write_single_coil(&self, address: u16, value: bool) -> Result<(), ModbusError> {
        let request = Request::write_coil(self.unit_id, address, value);
        self.execute(request).await.map(|_| ())
    }

    async fn write_single_register(&self, address: u16, value: u32) -> Result<(), ModbusError> {
        if value > u16::MAX as u32 {
            return Err(ModbusError::Validation(format!(
                "register value {} exceeds 65535",
                value
            )));
        }
        let request = Request::write_register(self.unit_id, address, value as u16);
        self.execute(request).await.map(|_| ())
    }
}
