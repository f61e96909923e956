//! S7comm framing over ISO-on-TCP
//!
//! Every frame is `TPKT(4) | COTP | S7`. Only the PDUs the gateway needs are
//! covered: connection request/confirm, setup communication, read var and
//! write var.

use bytes::{BufMut, Bytes, BytesMut};

use super::address::S7Address;
use crate::plc::driver::DriverError;

pub const TPKT_HEADER_LEN: usize = 4;
const COTP_DT_HEADER: [u8; 3] = [0x02, 0xF0, 0x80];
const S7_PROTOCOL_ID: u8 = 0x32;

const ROSCTR_JOB: u8 = 0x01;
const ROSCTR_ACK_DATA: u8 = 0x03;

const FN_SETUP_COMM: u8 = 0xF0;
const FN_READ_VAR: u8 = 0x04;
const FN_WRITE_VAR: u8 = 0x05;

const COTP_CR: u8 = 0xE0;
const COTP_CC: u8 = 0xD0;

/// Return code for a successful item
pub const ITEM_OK: u8 = 0xFF;

/// Items per read job; keeps requests inside the smallest negotiated PDU
pub const MAX_ITEMS_PER_REQUEST: usize = 19;

pub const LOCAL_TSAP: u16 = 0x0100;

/// Remote TSAP for a PG connection to the CPU in `rack`/`slot`
pub fn remote_tsap(rack: u16, slot: u16) -> u16 {
    0x0100 | (rack << 5) | slot
}

fn malformed(msg: impl Into<String>) -> DriverError {
    DriverError::failed(format!("malformed S7 frame: {}", msg.into()))
}

fn tpkt(payload_len: usize) -> BytesMut {
    let total = TPKT_HEADER_LEN + payload_len;
    let mut buf = BytesMut::with_capacity(total);
    buf.put_u8(0x03);
    buf.put_u8(0x00);
    buf.put_u16(total as u16);
    buf
}

/// Total frame length announced by a TPKT header
pub fn tpkt_length(header: &[u8; TPKT_HEADER_LEN]) -> Result<usize, DriverError> {
    if header[0] != 0x03 {
        return Err(malformed(format!("bad TPKT version 0x{:02X}", header[0])));
    }
    let len = usize::from(u16::from_be_bytes([header[2], header[3]]));
    if len < TPKT_HEADER_LEN + 3 {
        return Err(malformed(format!("TPKT length {} too short", len)));
    }
    Ok(len)
}

// ============================================================================
// COTP connection
// ============================================================================

pub fn connect_request(local_tsap: u16, remote_tsap: u16) -> Bytes {
    let cotp: [u8; 18] = [
        0x11, // length indicator
        COTP_CR,
        0x00,
        0x00, // destination reference
        0x00,
        0x01, // source reference
        0x00, // class 0
        0xC0,
        0x01,
        0x0A, // TPDU size 1024
        0xC1,
        0x02,
        (local_tsap >> 8) as u8,
        local_tsap as u8,
        0xC2,
        0x02,
        (remote_tsap >> 8) as u8,
        remote_tsap as u8,
    ];
    let mut buf = tpkt(cotp.len());
    buf.put_slice(&cotp);
    buf.freeze()
}

pub fn check_connect_confirm(frame: &[u8]) -> Result<(), DriverError> {
    match frame.get(5) {
        Some(&COTP_CC) => Ok(()),
        Some(other) => Err(DriverError::failed(format!(
            "connection rejected by PLC (COTP type 0x{:02X})",
            other
        ))),
        None => Err(malformed("connection confirm too short")),
    }
}

// ============================================================================
// S7 jobs
// ============================================================================

fn job(pdu_ref: u16, params: &[u8], data: &[u8]) -> Bytes {
    let s7_len = 10 + params.len() + data.len();
    let mut buf = tpkt(COTP_DT_HEADER.len() + s7_len);
    buf.put_slice(&COTP_DT_HEADER);
    buf.put_u8(S7_PROTOCOL_ID);
    buf.put_u8(ROSCTR_JOB);
    buf.put_u16(0x0000);
    buf.put_u16(pdu_ref);
    buf.put_u16(params.len() as u16);
    buf.put_u16(data.len() as u16);
    buf.put_slice(params);
    buf.put_slice(data);
    buf.freeze()
}

pub fn setup_communication(pdu_ref: u16, pdu_size: u16) -> Bytes {
    let mut params = BytesMut::with_capacity(8);
    params.put_u8(FN_SETUP_COMM);
    params.put_u8(0x00);
    params.put_u16(1); // max AmQ calling
    params.put_u16(1); // max AmQ called
    params.put_u16(pdu_size);
    job(pdu_ref, &params, &[])
}

fn put_item(params: &mut BytesMut, address: &S7Address) {
    params.put_u8(0x12); // variable specification
    params.put_u8(0x0A);
    params.put_u8(0x10); // S7ANY
    params.put_u8(address.request_transport());
    params.put_u16(address.request_count());
    params.put_u16(address.db);
    params.put_u8(address.area.code());
    let start = address.bit_address();
    params.put_u8((start >> 16) as u8);
    params.put_u8((start >> 8) as u8);
    params.put_u8(start as u8);
}

pub fn read_request(pdu_ref: u16, items: &[S7Address]) -> Bytes {
    let mut params = BytesMut::with_capacity(2 + items.len() * 12);
    params.put_u8(FN_READ_VAR);
    params.put_u8(items.len() as u8);
    for item in items {
        put_item(&mut params, item);
    }
    job(pdu_ref, &params, &[])
}

pub fn write_request(pdu_ref: u16, address: &S7Address, payload: &[u8]) -> Bytes {
    let mut params = BytesMut::with_capacity(14);
    params.put_u8(FN_WRITE_VAR);
    params.put_u8(1);
    put_item(&mut params, address);

    let mut data = BytesMut::with_capacity(4 + payload.len());
    data.put_u8(0x00);
    if address.is_bit() {
        data.put_u8(0x03);
        data.put_u16(1);
    } else {
        data.put_u8(0x04);
        data.put_u16((payload.len() * 8) as u16);
    }
    data.put_slice(payload);
    job(pdu_ref, &params, &data)
}

// ============================================================================
// Responses
// ============================================================================

/// Parameter and data sections of an ack-data PDU
#[derive(Debug)]
pub struct AckData<'a> {
    pub params: &'a [u8],
    pub data: &'a [u8],
}

/// Validate an ack-data frame and split out its sections
pub fn parse_ack(frame: &[u8], expected_ref: u16) -> Result<AckData<'_>, DriverError> {
    let s7 = frame
        .get(TPKT_HEADER_LEN + COTP_DT_HEADER.len()..)
        .ok_or_else(|| malformed("missing S7 header"))?;
    if s7.len() < 12 {
        return Err(malformed("S7 header too short"));
    }
    if s7[0] != S7_PROTOCOL_ID {
        return Err(malformed(format!("bad protocol id 0x{:02X}", s7[0])));
    }
    if s7[1] != ROSCTR_ACK_DATA {
        return Err(malformed(format!("unexpected ROSCTR 0x{:02X}", s7[1])));
    }
    let pdu_ref = u16::from_be_bytes([s7[4], s7[5]]);
    if pdu_ref != expected_ref {
        return Err(malformed(format!(
            "PDU reference mismatch: got {}, expected {}",
            pdu_ref, expected_ref
        )));
    }
    let (error_class, error_code) = (s7[10], s7[11]);
    if error_class != 0 || error_code != 0 {
        return Err(DriverError::failed(format!(
            "PLC rejected request (class 0x{:02X}, code 0x{:02X})",
            error_class, error_code
        )));
    }

    let param_len = usize::from(u16::from_be_bytes([s7[6], s7[7]]));
    let data_len = usize::from(u16::from_be_bytes([s7[8], s7[9]]));
    let body = &s7[12..];
    if body.len() < param_len + data_len {
        return Err(malformed("truncated S7 body"));
    }
    Ok(AckData {
        params: &body[..param_len],
        data: &body[param_len..param_len + data_len],
    })
}

/// Negotiated PDU size from a setup communication response
pub fn parse_setup_response(frame: &[u8], expected_ref: u16) -> Result<u16, DriverError> {
    let ack = parse_ack(frame, expected_ref)?;
    if ack.params.len() < 8 || ack.params[0] != FN_SETUP_COMM {
        return Err(malformed("bad setup communication response"));
    }
    Ok(u16::from_be_bytes([ack.params[6], ack.params[7]]))
}

/// Per-item outcome of a read: payload bytes or the item return code
pub type ItemResult = Result<Vec<u8>, u8>;

pub fn parse_read_response(
    frame: &[u8],
    expected_ref: u16,
    item_count: usize,
) -> Result<Vec<ItemResult>, DriverError> {
    let ack = parse_ack(frame, expected_ref)?;
    if ack.params.len() < 2 || ack.params[0] != FN_READ_VAR {
        return Err(malformed("bad read response parameters"));
    }
    if usize::from(ack.params[1]) != item_count {
        return Err(malformed(format!(
            "read response has {} item(s), expected {}",
            ack.params[1], item_count
        )));
    }

    let mut items = Vec::with_capacity(item_count);
    let mut data = ack.data;
    for index in 0..item_count {
        if data.len() < 4 {
            return Err(malformed("truncated read item header"));
        }
        let return_code = data[0];
        let transport = data[1];
        let raw_len = usize::from(u16::from_be_bytes([data[2], data[3]]));
        // BIT/BYTE/INT/DINT report length in bits; REAL/OCTET in bytes
        let len = match transport {
            0x03 | 0x04 | 0x05 | 0x06 => raw_len.div_ceil(8),
            _ => raw_len,
        };

        if return_code != ITEM_OK {
            // Failed items carry a bare 4-byte header
            items.push(Err(return_code));
            data = &data[4..];
            continue;
        }

        let end = 4 + len;
        if data.len() < end {
            return Err(malformed("truncated read item data"));
        }
        items.push(Ok(data[4..end].to_vec()));

        let padded = if len % 2 == 1 && index + 1 < item_count {
            end + 1
        } else {
            end
        };
        data = &data[padded.min(data.len())..];
    }
    Ok(items)
}

pub fn parse_write_response(frame: &[u8], expected_ref: u16) -> Result<(), DriverError> {
    let ack = parse_ack(frame, expected_ref)?;
    if ack.params.len() < 2 || ack.params[0] != FN_WRITE_VAR {
        return Err(malformed("bad write response parameters"));
    }
    match ack.data.first() {
        Some(&ITEM_OK) => Ok(()),
        Some(&code) => Err(DriverError::failed(format!(
            "write rejected: {}",
            describe_return_code(code)
        ))),
        None => Err(malformed("write response without return code")),
    }
}

pub fn describe_return_code(code: u8) -> String {
    let text = match code {
        0x01 => "hardware fault",
        0x03 => "access denied",
        0x05 => "address out of range",
        0x06 => "data type not supported",
        0x07 => "data type inconsistent",
        0x0A => "object does not exist",
        _ => "unknown error",
    };
    format!("{} (0x{:02X})", text, code)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack_frame(pdu_ref: u16, params: &[u8], data: &[u8]) -> Vec<u8> {
        let mut s7 = vec![S7_PROTOCOL_ID, ROSCTR_ACK_DATA, 0, 0];
        s7.extend_from_slice(&pdu_ref.to_be_bytes());
        s7.extend_from_slice(&(params.len() as u16).to_be_bytes());
        s7.extend_from_slice(&(data.len() as u16).to_be_bytes());
        s7.extend_from_slice(&[0, 0]);
        s7.extend_from_slice(params);
        s7.extend_from_slice(data);

        let total = TPKT_HEADER_LEN + COTP_DT_HEADER.len() + s7.len();
        let mut frame = vec![0x03, 0x00];
        frame.extend_from_slice(&(total as u16).to_be_bytes());
        frame.extend_from_slice(&COTP_DT_HEADER);
        frame.extend_from_slice(&s7);
        frame
    }

    #[test]
    fn test_connect_request_layout() {
        let frame = connect_request(LOCAL_TSAP, remote_tsap(0, 1));
        assert_eq!(frame.len(), 22);
        assert_eq!(&frame[..4], &[0x03, 0x00, 0x00, 22]);
        assert_eq!(frame[5], COTP_CR);
        assert_eq!(&frame[frame.len() - 2..], &[0x01, 0x01]);
        assert_eq!(remote_tsap(0, 2), 0x0102);
        assert_eq!(remote_tsap(1, 3), 0x0123);
    }

    #[test]
    fn test_read_request_item_encoding() {
        let addr: S7Address = "DB1,X2.3".parse().unwrap();
        let frame = read_request(7, &[addr]);
        let s7 = &frame[7..];
        assert_eq!(&s7[..2], &[S7_PROTOCOL_ID, ROSCTR_JOB]);
        assert_eq!(u16::from_be_bytes([s7[4], s7[5]]), 7);
        let params = &s7[10..];
        assert_eq!(params[0], FN_READ_VAR);
        assert_eq!(params[1], 1);
        // transport, count, db, area, 24-bit address
        assert_eq!(&params[5..], &[0x01, 0x00, 0x01, 0x00, 0x01, 0x84, 0x00, 0x00, 19]);
        assert_eq!(tpkt_length(&[frame[0], frame[1], frame[2], frame[3]]).unwrap(), frame.len());
    }

    #[test]
    fn test_write_request_data_section() {
        let addr: S7Address = "DB1,INT4".parse().unwrap();
        let frame = write_request(3, &addr, &[0x00, 0x50]);
        let s7 = &frame[7..];
        let param_len = usize::from(u16::from_be_bytes([s7[6], s7[7]]));
        let data = &s7[10 + param_len..];
        assert_eq!(data, &[0x00, 0x04, 0x00, 0x10, 0x00, 0x50]);
    }

    #[test]
    fn test_parse_read_response_with_padding() {
        let data = [
            0xFF, 0x03, 0x00, 0x01, 0x01, 0x00, // bit item, padded
            0xFF, 0x04, 0x00, 0x10, 0x00, 0x2A, // word item
        ];
        let frame = ack_frame(9, &[FN_READ_VAR, 2], &data);
        let items = parse_read_response(&frame, 9, 2).unwrap();
        assert_eq!(items, vec![Ok(vec![0x01]), Ok(vec![0x00, 0x2A])]);
    }

    #[test]
    fn test_parse_read_response_item_error() {
        let frame = ack_frame(1, &[FN_READ_VAR, 1], &[0x0A, 0x00, 0x00, 0x00]);
        let items = parse_read_response(&frame, 1, 1).unwrap();
        assert_eq!(items, vec![Err(0x0A)]);
    }

    #[test]
    fn test_pdu_reference_mismatch() {
        let frame = ack_frame(2, &[FN_WRITE_VAR, 1], &[ITEM_OK]);
        assert!(parse_write_response(&frame, 3).is_err());
        assert!(parse_write_response(&frame, 2).is_ok());
    }

    #[test]
    fn test_setup_response() {
        let frame = ack_frame(1, &[FN_SETUP_COMM, 0, 0, 1, 0, 1, 0x00, 0xF0], &[]);
        assert_eq!(parse_setup_response(&frame, 1).unwrap(), 240);
    }

    #[test]
    fn test_write_rejected_code() {
        let frame = ack_frame(4, &[FN_WRITE_VAR, 1], &[0x05]);
        let err = parse_write_response(&frame, 4).unwrap_err();
        assert!(err.to_string().contains("address out of range"));
    }
}
