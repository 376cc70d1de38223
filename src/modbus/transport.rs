use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::frame::{MbapHeader, MBAP_HEADER_LEN};
use crate::utils::error::ModbusError;

/// Read one complete MBAP frame: the fixed 7-byte header, then exactly the
/// number of PDU bytes its length field announces. Framing relies on the
/// length field, so a header that cannot frame a PDU leaves the stream
/// unsynchronized and is surfaced as an error to the caller, which closes
/// the connection.
pub async fn read_frame<R>(reader: &mut R) -> Result<(MbapHeader, Vec<u8>), ModbusError>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; MBAP_HEADER_LEN];
    reader.read_exact(&mut header_buf).await?;
    let header = MbapHeader::decode(&header_buf)?;

    let mut pdu = vec![0u8; header.pdu_len()];
    reader.read_exact(&mut pdu).await?;

    debug!(
        "📥 Frame received: txn={} unit={} pdu={}",
        header.transaction_id,
        header.unit_id,
        hex::encode(&pdu)
    );
    Ok((header, pdu))
}

pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), ModbusError>
where
    W: AsyncWrite + Unpin,
{
    debug!("📤 Frame sent: {}", hex::encode(frame));
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}
