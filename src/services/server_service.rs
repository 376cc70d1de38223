use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

use crate::config::ServerConfig;
use crate::devices::PressureSensor;
use crate::modbus::frame::{
    self, ExceptionCode, FunctionCode, MbapHeader, Request, MODBUS_PROTOCOL_ID,
};
use crate::modbus::registers::{BankValues, RegisterStore};
use crate::modbus::transport;
use crate::utils::error::ModbusError;

/// Modbus TCP server fronting the simulated PT-100.
///
/// One task per client connection; every connection answers from the same
/// register store, which also drifts on its own timer. The store mutex is
/// the single synchronization point between the two.
pub struct ModbusServer {
    config: ServerConfig,
    device: PressureSensor,
}

impl ModbusServer {
    pub fn new(config: ServerConfig) -> Self {
        let device = PressureSensor::new(&config.layout);
        Self { config, device }
    }

    pub fn device(&self) -> &PressureSensor {
        &self.device
    }

    /// Accept clients until ctrl-c. The drift task stops with the server.
    pub async fn run(&self) -> Result<(), ModbusError> {
        let bind_address = format!("{}:{}", self.config.bind_host, self.config.bind_port);
        let listener = TcpListener::bind(&bind_address).await.map_err(|e| {
            ModbusError::ConnectRefused(format!("failed to bind {}: {}", bind_address, e))
        })?;

        info!("🔌 Modbus TCP server listening on {}", bind_address);
        info!("🏷️  Simulated device: {}", self.device.name());

        let drift = self
            .device
            .spawn_drift(Duration::from_millis(self.config.drift_interval_ms));
        let store = self.device.store();

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("🛑 Stopping Modbus server...");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            info!("🔗 Client connected: {}", peer);
                            let store = Arc::clone(&store);
                            tokio::spawn(async move {
                                handle_connection(stream, peer, store).await;
                            });
                        }
                        Err(e) => {
                            error!("❌ Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }

        drift.stop();
        info!("✅ Modbus server stopped");
        Ok(())
    }
}

/// Serve one client: read frames, answer each from the store. A request the
/// store rejects gets an exception frame; a header that cannot frame a PDU
/// ends the connection, since the stream offset is no longer trustworthy.
pub(crate) async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    store: Arc<Mutex<RegisterStore>>,
) {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();

    loop {
        match transport::read_frame(&mut reader).await {
            Ok((header, pdu)) => {
                let Some(reply) = build_reply(&header, &pdu, &store) else {
                    continue;
                };
                if let Err(e) = transport::write_frame(&mut writer, &reply).await {
                    warn!("❌ Failed to reply to {}: {}", peer, e);
                    break;
                }
            }
            Err(ModbusError::ConnectionLost(_)) => {
                info!("🔌 Client {} disconnected", peer);
                break;
            }
            Err(e) => {
                warn!("⚠️  Dropping client {}: {}", peer, e);
                break;
            }
        }
    }
}

/// Build the reply frame for one request, or None to drop the frame and keep
/// the connection. The unit id is echoed as received: like the original
/// single-context device, the server answers whatever unit is addressed.
pub(crate) fn build_reply(
    header: &MbapHeader,
    pdu: &[u8],
    store: &Mutex<RegisterStore>,
) -> Option<Vec<u8>> {
    if header.protocol_id != MODBUS_PROTOCOL_ID {
        warn!(
            "⚠️  Dropping frame with protocol id {} from transaction {}",
            header.protocol_id, header.transaction_id
        );
        return None;
    }

    let raw_function = *pdu.first()?;
    let request = match frame::decode_request_pdu(header, pdu) {
        Ok(request) => request,
        Err(code) => {
            warn!(
                "⚠️  Rejecting request (function 0x{:02x}): {}",
                raw_function, code
            );
            return Some(frame::encode_exception(
                header.transaction_id,
                header.unit_id,
                raw_function,
                code,
            ));
        }
    };

    let outcome = match store.lock() {
        Ok(mut store) => apply_request(&mut store, &request),
        Err(_) => {
            error!("❌ Register store lock poisoned");
            Err(ExceptionCode::SlaveDeviceFailure)
        }
    };

    Some(match outcome {
        Ok(Some(values)) => frame::encode_read_response(&request, &values),
        Ok(None) => frame::encode_write_response(&request),
        Err(code) => frame::encode_exception(
            header.transaction_id,
            header.unit_id,
            request.function.as_u8(),
            code,
        ),
    })
}

/// Reads return values; writes return None and are answered with an echo.
fn apply_request(
    store: &mut RegisterStore,
    request: &Request,
) -> Result<Option<BankValues>, ExceptionCode> {
    match request.function {
        FunctionCode::ReadCoils
        | FunctionCode::ReadDiscreteInputs
        | FunctionCode::ReadHoldingRegisters
        | FunctionCode::ReadInputRegisters => store
            .read(request.function.bank(), request.address, request.count)
            .map(Some),
        FunctionCode::WriteSingleCoil => {
            store.write_coil(request.address, request.value).map(|_| None)
        }
        FunctionCode::WriteSingleRegister => store
            .write_register(request.address, request.value)
            .map(|_| None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::client::{ModbusClient, ModbusClientTrait};
    use crate::modbus::frame::MBAP_HEADER_LEN;
    use crate::modbus::registers::BankLayout;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn spawn_server(store: RegisterStore) -> (SocketAddr, Arc<Mutex<RegisterStore>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let store = Arc::new(Mutex::new(store));
        let shared = Arc::clone(&store);
        tokio::spawn(async move {
            loop {
                let Ok((stream, peer)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(handle_connection(stream, peer, Arc::clone(&shared)));
            }
        });
        (addr, store)
    }

    async fn connect(addr: SocketAddr) -> ModbusClient {
        ModbusClient::connect("127.0.0.1", addr.port(), 1, Duration::from_secs(1))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_read_holding_registers_returns_seeded_values() {
        let mut store = RegisterStore::new(&BankLayout::default());
        for (i, value) in [3u16, 17, 0, 20, 8].iter().enumerate() {
            store.write_register(i as u16, *value).unwrap();
        }
        let (addr, _store) = spawn_server(store).await;

        let client = connect(addr).await;
        let values = client.read_holding_registers(0, 5).await.unwrap();
        assert_eq!(values, vec![3, 17, 0, 20, 8]);
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_write_coil_then_read_back() {
        let (addr, _store) = spawn_server(RegisterStore::new(&BankLayout::default())).await;

        let client = connect(addr).await;
        client.write_single_coil(2, true).await.unwrap();
        let bits = client.read_coils(2, 1).await.unwrap();
        assert_eq!(bits, vec![true]);
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_write_register_then_read_back() {
        let (addr, _store) = spawn_server(RegisterStore::new(&BankLayout::default())).await;

        let client = connect(addr).await;
        client.write_single_register(0, 1234).await.unwrap();
        let values = client.read_holding_registers(0, 1).await.unwrap();
        assert_eq!(values, vec![1234]);
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_out_of_range_read_yields_illegal_data_address() {
        let (addr, _store) = spawn_server(RegisterStore::new(&BankLayout::default())).await;

        let client = connect(addr).await;
        // The default layout has 20 holding registers.
        let err = client.read_holding_registers(18, 3).await.unwrap_err();
        assert!(matches!(
            err,
            ModbusError::Exception(ExceptionCode::IllegalDataAddress)
        ));
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_discrete_inputs_and_input_registers_are_served() {
        let mut store = RegisterStore::new(&BankLayout::default());
        store.set_discrete_input(1, true).unwrap();
        store.set_input_register(0, 19).unwrap();
        let (addr, _store) = spawn_server(store).await;

        let client = connect(addr).await;
        assert_eq!(
            client.read_discrete_inputs(0, 2).await.unwrap(),
            vec![false, true]
        );
        assert_eq!(client.read_input_registers(0, 1).await.unwrap(), vec![19]);
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_unknown_function_code_answered_with_exception_frame() {
        let (addr, _store) = spawn_server(RegisterStore::new(&BankLayout::default())).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        // Transaction 9, protocol 0, length 6, unit 1, function 0x0F.
        let raw = [
            0x00, 0x09, 0x00, 0x00, 0x00, 0x06, 0x01, 0x0F, 0x00, 0x00, 0x00, 0x01,
        ];
        stream.write_all(&raw).await.unwrap();

        let mut reply = [0u8; MBAP_HEADER_LEN + 2];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..2], &[0x00, 0x09]);
        assert_eq!(reply[MBAP_HEADER_LEN], 0x0F | 0x80);
        assert_eq!(reply[MBAP_HEADER_LEN + 1], ExceptionCode::IllegalFunction.as_u8());
    }

    #[tokio::test]
    async fn test_raw_coil_write_with_bad_value_is_illegal_data_value() {
        let (addr, _store) = spawn_server(RegisterStore::new(&BankLayout::default())).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        // Function 0x05 with value 0x1234: neither 0xFF00 nor 0x0000.
        let raw = [
            0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x05, 0x00, 0x00, 0x12, 0x34,
        ];
        stream.write_all(&raw).await.unwrap();

        let mut reply = [0u8; MBAP_HEADER_LEN + 2];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[MBAP_HEADER_LEN], 0x05 | 0x80);
        assert_eq!(
            reply[MBAP_HEADER_LEN + 1],
            ExceptionCode::IllegalDataValue.as_u8()
        );
    }

    #[tokio::test]
    async fn test_concurrent_clients_share_one_store() {
        let (addr, _store) = spawn_server(RegisterStore::new(&BankLayout::default())).await;

        let writer = connect(addr).await;
        let reader = connect(addr).await;
        writer.write_single_register(5, 777).await.unwrap();
        assert_eq!(reader.read_holding_registers(5, 1).await.unwrap(), vec![777]);
        writer.disconnect().await;
        reader.disconnect().await;
    }
}
