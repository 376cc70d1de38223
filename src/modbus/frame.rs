use bytes::{Buf, BufMut, BytesMut};
use std::fmt;

use crate::utils::error::ModbusError;

/// MBAP header: transaction id, protocol id, length, unit id.
pub const MBAP_HEADER_LEN: usize = 7;

/// Protocol identifier for Modbus TCP. Always zero.
pub const MODBUS_PROTOCOL_ID: u16 = 0;

/// Wire encoding of a coil in ON state (function 0x05).
pub const COIL_ON: u16 = 0xFF00;
/// Wire encoding of a coil in OFF state (function 0x05).
pub const COIL_OFF: u16 = 0x0000;

/// Protocol limits for a single read request.
pub const MAX_BIT_COUNT: u16 = 2000;
pub const MAX_WORD_COUNT: u16 = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterBank {
    Coils,
    DiscreteInputs,
    HoldingRegisters,
    InputRegisters,
}

impl RegisterBank {
    pub fn is_bit_bank(&self) -> bool {
        matches!(self, RegisterBank::Coils | RegisterBank::DiscreteInputs)
    }

    pub fn read_function(&self) -> FunctionCode {
        match self {
            RegisterBank::Coils => FunctionCode::ReadCoils,
            RegisterBank::DiscreteInputs => FunctionCode::ReadDiscreteInputs,
            RegisterBank::HoldingRegisters => FunctionCode::ReadHoldingRegisters,
            RegisterBank::InputRegisters => FunctionCode::ReadInputRegisters,
        }
    }

    pub fn parse(name: &str) -> Option<RegisterBank> {
        match name.to_lowercase().as_str() {
            "coils" | "coil" | "co" => Some(RegisterBank::Coils),
            "discrete-inputs" | "discrete" | "di" => Some(RegisterBank::DiscreteInputs),
            "holding-registers" | "holding" | "hr" => Some(RegisterBank::HoldingRegisters),
            "input-registers" | "input" | "ir" => Some(RegisterBank::InputRegisters),
            _ => None,
        }
    }
}

impl fmt::Display for RegisterBank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegisterBank::Coils => "coils",
            RegisterBank::DiscreteInputs => "discrete-inputs",
            RegisterBank::HoldingRegisters => "holding-registers",
            RegisterBank::InputRegisters => "input-registers",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionCode {
    ReadCoils,
    ReadDiscreteInputs,
    ReadHoldingRegisters,
    ReadInputRegisters,
    WriteSingleCoil,
    WriteSingleRegister,
}

impl FunctionCode {
    pub fn as_u8(&self) -> u8 {
        match self {
            FunctionCode::ReadCoils => 0x01,
            FunctionCode::ReadDiscreteInputs => 0x02,
            FunctionCode::ReadHoldingRegisters => 0x03,
            FunctionCode::ReadInputRegisters => 0x04,
            FunctionCode::WriteSingleCoil => 0x05,
            FunctionCode::WriteSingleRegister => 0x06,
        }
    }

    pub fn from_u8(code: u8) -> Option<FunctionCode> {
        match code {
            0x01 => Some(FunctionCode::ReadCoils),
            0x02 => Some(FunctionCode::ReadDiscreteInputs),
            0x03 => Some(FunctionCode::ReadHoldingRegisters),
            0x04 => Some(FunctionCode::ReadInputRegisters),
            0x05 => Some(FunctionCode::WriteSingleCoil),
            0x06 => Some(FunctionCode::WriteSingleRegister),
            _ => None,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self,
            FunctionCode::WriteSingleCoil | FunctionCode::WriteSingleRegister
        )
    }

    /// The register bank a function operates on.
    pub fn bank(&self) -> RegisterBank {
        match self {
            FunctionCode::ReadCoils | FunctionCode::WriteSingleCoil => RegisterBank::Coils,
            FunctionCode::ReadDiscreteInputs => RegisterBank::DiscreteInputs,
            FunctionCode::ReadHoldingRegisters | FunctionCode::WriteSingleRegister => {
                RegisterBank::HoldingRegisters
            }
            FunctionCode::ReadInputRegisters => RegisterBank::InputRegisters,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    SlaveDeviceFailure,
    Other(u8),
}

impl ExceptionCode {
    pub fn as_u8(&self) -> u8 {
        match self {
            ExceptionCode::IllegalFunction => 0x01,
            ExceptionCode::IllegalDataAddress => 0x02,
            ExceptionCode::IllegalDataValue => 0x03,
            ExceptionCode::SlaveDeviceFailure => 0x04,
            ExceptionCode::Other(code) => *code,
        }
    }

    pub fn from_u8(code: u8) -> ExceptionCode {
        match code {
            0x01 => ExceptionCode::IllegalFunction,
            0x02 => ExceptionCode::IllegalDataAddress,
            0x03 => ExceptionCode::IllegalDataValue,
            0x04 => ExceptionCode::SlaveDeviceFailure,
            other => ExceptionCode::Other(other),
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExceptionCode::IllegalFunction => write!(f, "illegal function (0x01)"),
            ExceptionCode::IllegalDataAddress => write!(f, "illegal data address (0x02)"),
            ExceptionCode::IllegalDataValue => write!(f, "illegal data value (0x03)"),
            ExceptionCode::SlaveDeviceFailure => write!(f, "slave device failure (0x04)"),
            ExceptionCode::Other(code) => write!(f, "exception code 0x{:02x}", code),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    /// Parse the fixed 7-byte header. The length field covers unit id +
    /// function code + payload, so anything below 2 cannot frame a PDU and
    /// anything above 254 exceeds the Modbus ADU limit.
    pub fn decode(buf: &[u8; MBAP_HEADER_LEN]) -> Result<MbapHeader, ModbusError> {
        let mut cursor = &buf[..];
        let transaction_id = cursor.get_u16();
        let protocol_id = cursor.get_u16();
        let length = cursor.get_u16();
        let unit_id = cursor.get_u8();

        if !(2..=254).contains(&length) {
            return Err(ModbusError::Protocol(format!(
                "invalid MBAP length field: {}",
                length
            )));
        }

        Ok(MbapHeader {
            transaction_id,
            protocol_id,
            length,
            unit_id,
        })
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u16(self.transaction_id);
        buf.put_u16(self.protocol_id);
        buf.put_u16(self.length);
        buf.put_u8(self.unit_id);
    }

    /// Number of PDU bytes (function code + payload) following the header.
    pub fn pdu_len(&self) -> usize {
        self.length as usize - 1
    }
}

/// A single Modbus request. Immutable once sent; the transaction manager
/// keeps a copy so the matching response can be decoded against it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub transaction_id: u16,
    pub unit_id: u8,
    pub function: FunctionCode,
    pub address: u16,
    /// Cell count for reads; always 1 for single writes.
    pub count: u16,
    /// Raw wire value for writes (0xFF00/0x0000 for coils); 0 for reads.
    pub value: u16,
}

impl Request {
    pub fn read(unit_id: u8, bank: RegisterBank, address: u16, count: u16) -> Request {
        Request {
            transaction_id: 0,
            unit_id,
            function: bank.read_function(),
            address,
            count,
            value: 0,
        }
    }

    pub fn write_coil(unit_id: u8, address: u16, on: bool) -> Request {
        Request {
            transaction_id: 0,
            unit_id,
            function: FunctionCode::WriteSingleCoil,
            address,
            count: 1,
            value: if on { COIL_ON } else { COIL_OFF },
        }
    }

    pub fn write_register(unit_id: u8, address: u16, value: u16) -> Request {
        Request {
            transaction_id: 0,
            unit_id,
            function: FunctionCode::WriteSingleRegister,
            address,
            count: 1,
            value,
        }
    }

    /// Encode the full ADU: 7-byte MBAP header followed by the 5-byte PDU.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(MBAP_HEADER_LEN + 5);
        let header = MbapHeader {
            transaction_id: self.transaction_id,
            protocol_id: MODBUS_PROTOCOL_ID,
            length: 6, // unit id + function code + 4 payload bytes
            unit_id: self.unit_id,
        };
        header.encode_into(&mut buf);
        buf.put_u8(self.function.as_u8());
        buf.put_u16(self.address);
        if self.function.is_write() {
            buf.put_u16(self.value);
        } else {
            buf.put_u16(self.count);
        }
        buf.to_vec()
    }
}

/// Decoded payload of a successful response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    Bits(Vec<bool>),
    Words(Vec<u16>),
    Echo { address: u16, value: u16 },
}

/// Decode a response PDU against the request that produced it.
///
/// The function code must equal the request's, or the request's | 0x80 for
/// an exception frame. Every length field is checked against the actual
/// payload. This is a pure function: a malformed frame cannot affect the
/// next decode call.
pub fn decode_response_pdu(request: &Request, pdu: &[u8]) -> Result<ResponseBody, ModbusError> {
    let function = request.function.as_u8();
    let first = *pdu
        .first()
        .ok_or_else(|| ModbusError::Protocol("empty response PDU".to_string()))?;

    if first == function | 0x80 {
        if pdu.len() != 2 {
            return Err(ModbusError::Protocol(format!(
                "exception frame must be 2 bytes, got {}",
                pdu.len()
            )));
        }
        return Err(ModbusError::Exception(ExceptionCode::from_u8(pdu[1])));
    }

    if first != function {
        return Err(ModbusError::Protocol(format!(
            "function code mismatch: sent 0x{:02x}, received 0x{:02x}",
            function, first
        )));
    }

    match request.function {
        FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
            let expected = (request.count as usize + 7) / 8;
            let byte_count = *pdu
                .get(1)
                .ok_or_else(|| ModbusError::Protocol("missing byte count".to_string()))?
                as usize;
            if byte_count != expected || pdu.len() != 2 + byte_count {
                return Err(ModbusError::Protocol(format!(
                    "bit response length mismatch: byte count {}, payload {}",
                    byte_count,
                    pdu.len() - 2
                )));
            }
            let mut bits = Vec::with_capacity(request.count as usize);
            for i in 0..request.count as usize {
                let byte = pdu[2 + i / 8];
                bits.push((byte >> (i % 8)) & 0x01 != 0);
            }
            Ok(ResponseBody::Bits(bits))
        }
        FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
            let expected = request.count as usize * 2;
            let byte_count = *pdu
                .get(1)
                .ok_or_else(|| ModbusError::Protocol("missing byte count".to_string()))?
                as usize;
            if byte_count != expected || pdu.len() != 2 + byte_count {
                return Err(ModbusError::Protocol(format!(
                    "register response length mismatch: byte count {}, payload {}",
                    byte_count,
                    pdu.len() - 2
                )));
            }
            let mut words = Vec::with_capacity(request.count as usize);
            let mut cursor = &pdu[2..];
            for _ in 0..request.count {
                words.push(cursor.get_u16());
            }
            Ok(ResponseBody::Words(words))
        }
        FunctionCode::WriteSingleCoil | FunctionCode::WriteSingleRegister => {
            if pdu.len() != 5 {
                return Err(ModbusError::Protocol(format!(
                    "write echo must be 5 bytes, got {}",
                    pdu.len()
                )));
            }
            let mut cursor = &pdu[1..];
            let address = cursor.get_u16();
            let value = cursor.get_u16();
            if address != request.address || value != request.value {
                return Err(ModbusError::Protocol(format!(
                    "write echo mismatch: sent {}={}, received {}={}",
                    request.address, request.value, address, value
                )));
            }
            Ok(ResponseBody::Echo { address, value })
        }
    }
}

/// Server side: decode a request PDU received under `header`.
///
/// An unknown function code maps to IllegalFunction and a payload of the
/// wrong size to IllegalDataValue, both answered as exception frames by the
/// caller.
pub fn decode_request_pdu(header: &MbapHeader, pdu: &[u8]) -> Result<Request, ExceptionCode> {
    let first = *pdu.first().ok_or(ExceptionCode::IllegalDataValue)?;
    let function = FunctionCode::from_u8(first).ok_or(ExceptionCode::IllegalFunction)?;
    if pdu.len() != 5 {
        return Err(ExceptionCode::IllegalDataValue);
    }

    let mut cursor = &pdu[1..];
    let address = cursor.get_u16();
    let third = cursor.get_u16();

    let (count, value) = if function.is_write() {
        (1, third)
    } else {
        (third, 0)
    };

    Ok(Request {
        transaction_id: header.transaction_id,
        unit_id: header.unit_id,
        function,
        address,
        count,
        value,
    })
}

fn encode_frame(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(MBAP_HEADER_LEN + pdu.len());
    let header = MbapHeader {
        transaction_id,
        protocol_id: MODBUS_PROTOCOL_ID,
        length: (pdu.len() + 1) as u16,
        unit_id,
    };
    header.encode_into(&mut buf);
    buf.put_slice(pdu);
    buf.to_vec()
}

/// Server side: encode a successful read response for `request`.
/// Bits are packed LSB-first and padded to full bytes.
pub fn encode_read_response(request: &Request, values: &crate::modbus::registers::BankValues) -> Vec<u8> {
    use crate::modbus::registers::BankValues;

    let mut pdu = BytesMut::new();
    pdu.put_u8(request.function.as_u8());
    match values {
        BankValues::Bits(bits) => {
            let byte_count = (bits.len() + 7) / 8;
            pdu.put_u8(byte_count as u8);
            let mut packed = vec![0u8; byte_count];
            for (i, bit) in bits.iter().enumerate() {
                if *bit {
                    packed[i / 8] |= 1 << (i % 8);
                }
            }
            pdu.put_slice(&packed);
        }
        BankValues::Words(words) => {
            pdu.put_u8((words.len() * 2) as u8);
            for word in words {
                pdu.put_u16(*word);
            }
        }
    }
    encode_frame(request.transaction_id, request.unit_id, &pdu)
}

/// Server side: a successful single write echoes the request payload.
pub fn encode_write_response(request: &Request) -> Vec<u8> {
    let mut pdu = BytesMut::with_capacity(5);
    pdu.put_u8(request.function.as_u8());
    pdu.put_u16(request.address);
    pdu.put_u16(request.value);
    encode_frame(request.transaction_id, request.unit_id, &pdu)
}

/// Server side: exception frame for a rejected request. `raw_function` is
/// the code as received, so even unknown codes are echoed with the high bit.
pub fn encode_exception(
    transaction_id: u16,
    unit_id: u8,
    raw_function: u8,
    code: ExceptionCode,
) -> Vec<u8> {
    let pdu = [raw_function | 0x80, code.as_u8()];
    encode_frame(transaction_id, unit_id, &pdu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::registers::BankValues;

    #[test]
    fn test_read_request_wire_layout() {
        let mut request = Request::read(1, RegisterBank::HoldingRegisters, 0x00F4, 3);
        request.transaction_id = 0x0102;
        let frame = request.encode();
        assert_eq!(
            frame,
            vec![0x01, 0x02, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0xF4, 0x00, 0x03]
        );
    }

    #[test]
    fn test_write_coil_wire_layout() {
        let mut request = Request::write_coil(1, 2, true);
        request.transaction_id = 7;
        let frame = request.encode();
        assert_eq!(
            frame,
            vec![0x00, 0x07, 0x00, 0x00, 0x00, 0x06, 0x01, 0x05, 0x00, 0x02, 0xFF, 0x00]
        );
    }

    #[test]
    fn test_request_codec_round_trip() {
        let mut request = Request::read(3, RegisterBank::Coils, 10, 16);
        request.transaction_id = 0xBEEF;
        let frame = request.encode();

        let mut header_bytes = [0u8; MBAP_HEADER_LEN];
        header_bytes.copy_from_slice(&frame[..MBAP_HEADER_LEN]);
        let header = MbapHeader::decode(&header_bytes).unwrap();
        assert_eq!(header.transaction_id, 0xBEEF);
        assert_eq!(header.protocol_id, 0);
        assert_eq!(header.pdu_len(), frame.len() - MBAP_HEADER_LEN);

        let decoded = decode_request_pdu(&header, &frame[MBAP_HEADER_LEN..]).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_word_response_round_trip() {
        let mut request = Request::read(1, RegisterBank::HoldingRegisters, 0, 5);
        request.transaction_id = 42;
        let values = BankValues::Words(vec![3, 17, 0, 20, 8]);
        let frame = encode_read_response(&request, &values);
        let body = decode_response_pdu(&request, &frame[MBAP_HEADER_LEN..]).unwrap();
        assert_eq!(body, ResponseBody::Words(vec![3, 17, 0, 20, 8]));
    }

    #[test]
    fn test_bit_response_round_trip_with_padding() {
        let mut request = Request::read(1, RegisterBank::Coils, 0, 10);
        request.transaction_id = 9;
        let bits = vec![
            true, false, true, true, false, false, false, true, true, false,
        ];
        let frame = encode_read_response(&request, &BankValues::Bits(bits.clone()));
        // 10 bits pack into 2 bytes
        assert_eq!(frame[MBAP_HEADER_LEN + 1], 2);
        let body = decode_response_pdu(&request, &frame[MBAP_HEADER_LEN..]).unwrap();
        assert_eq!(body, ResponseBody::Bits(bits));
    }

    #[test]
    fn test_exception_response_decoding() {
        let request = Request::read(1, RegisterBank::InputRegisters, 100, 1);
        let frame = encode_exception(0, 1, 0x04, ExceptionCode::IllegalDataAddress);
        let err = decode_response_pdu(&request, &frame[MBAP_HEADER_LEN..]).unwrap_err();
        assert!(matches!(
            err,
            ModbusError::Exception(ExceptionCode::IllegalDataAddress)
        ));
    }

    #[test]
    fn test_function_code_mismatch_is_protocol_error() {
        let request = Request::read(1, RegisterBank::Coils, 0, 1);
        // Response claims function 0x03 against a 0x01 request.
        let pdu = [0x03, 0x02, 0x00, 0x05];
        let err = decode_response_pdu(&request, &pdu).unwrap_err();
        assert!(matches!(err, ModbusError::Protocol(_)));
    }

    #[test]
    fn test_byte_count_mismatch_is_protocol_error() {
        let request = Request::read(1, RegisterBank::HoldingRegisters, 0, 2);
        // Byte count says 4 but only 2 payload bytes follow.
        let pdu = [0x03, 0x04, 0x00, 0x05];
        let err = decode_response_pdu(&request, &pdu).unwrap_err();
        assert!(matches!(err, ModbusError::Protocol(_)));

        // Decoder state is per-call: a well-formed frame decodes fine after
        // the failure.
        let good = [0x03, 0x04, 0x00, 0x05, 0x00, 0x06];
        let body = decode_response_pdu(&request, &good).unwrap();
        assert_eq!(body, ResponseBody::Words(vec![5, 6]));
    }

    #[test]
    fn test_write_echo_mismatch_is_protocol_error() {
        let request = Request::write_register(1, 4, 1234);
        let mut echoed = request.clone();
        echoed.value = 999;
        let frame = encode_write_response(&echoed);
        let err = decode_response_pdu(&request, &frame[MBAP_HEADER_LEN..]).unwrap_err();
        assert!(matches!(err, ModbusError::Protocol(_)));
    }

    #[test]
    fn test_header_rejects_bad_length() {
        let bytes = [0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x01];
        assert!(MbapHeader::decode(&bytes).is_err());
        let bytes = [0x00, 0x01, 0x00, 0x00, 0x01, 0x00, 0x01];
        assert!(MbapHeader::decode(&bytes).is_err());
    }

    #[test]
    fn test_unknown_request_function_is_illegal_function() {
        let header = MbapHeader {
            transaction_id: 1,
            protocol_id: 0,
            length: 6,
            unit_id: 1,
        };
        let pdu = [0x2B, 0x00, 0x00, 0x00, 0x01];
        assert_eq!(
            decode_request_pdu(&header, &pdu).unwrap_err(),
            ExceptionCode::IllegalFunction
        );
    }

    #[test]
    fn test_truncated_request_is_illegal_data_value() {
        let header = MbapHeader {
            transaction_id: 1,
            protocol_id: 0,
            length: 4,
            unit_id: 1,
        };
        let pdu = [0x03, 0x00, 0x00];
        assert_eq!(
            decode_request_pdu(&header, &pdu).unwrap_err(),
            ExceptionCode::IllegalDataValue
        );
    }
}
