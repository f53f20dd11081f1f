//! Decoding of raw owner-pid TCP tables into `ConnectionRecord`s
//!
//! Buffer layout (little-endian, as produced by the native table query):
//!
//! ```text
//! u32 row count
//! row[0] row[1] ...            packed, no padding
//! ```
//!
//! IPv4 row, 24 bytes:
//! `state u32 | local addr [u8; 4] | local port u32 | remote addr [u8; 4] | remote port u32 | pid u32`
//!
//! IPv6 row, 56 bytes:
//! `local addr [u8; 16] | local scope u32 | local port u32 | remote addr [u8; 16] | remote scope u32 | remote port u32 | state u32 | pid u32`
//!
//! Port fields are 32 bits wide but only the low half-word is meaningful, and
//! that half-word is already in network byte order.

use crate::backends::table::AddressFamily;
use crate::connection::{ConnectionRecord, ConnectionState};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use thiserror::Error;

/// Width of the row-count header
pub const HEADER_LEN: usize = 4;
/// Width of one IPv4 owner-pid row
pub const IPV4_ROW_LEN: usize = 24;
/// Width of one IPv6 owner-pid row
pub const IPV6_ROW_LEN: usize = 56;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{family} table buffer too short for its header ({len} bytes)")]
    TruncatedHeader { family: AddressFamily, len: usize },
    #[error("{family} table declares {declared} rows ({needed} bytes) but buffer holds {available}")]
    SizeMismatch {
        family: AddressFamily,
        declared: u32,
        needed: usize,
        available: usize,
    },
    #[error("{family} row must be {expected} bytes, got {actual}")]
    RowLength {
        family: AddressFamily,
        expected: usize,
        actual: usize,
    },
}

/// Row width for a family
pub fn row_len(family: AddressFamily) -> usize {
    match family {
        AddressFamily::Ipv4 => IPV4_ROW_LEN,
        AddressFamily::Ipv6 => IPV6_ROW_LEN,
    }
}

/// Decode a complete table buffer.
///
/// Rows are walked one after another from the end of the header; bytes past
/// the last declared row are ignored.
pub fn decode_table(
    family: AddressFamily,
    buffer: &[u8],
) -> Result<Vec<ConnectionRecord>, DecodeError> {
    let header: [u8; HEADER_LEN] = buffer
        .get(..HEADER_LEN)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(DecodeError::TruncatedHeader {
            family,
            len: buffer.len(),
        })?;
    let declared = u32::from_le_bytes(header);

    let stride = row_len(family);
    let needed = (declared as usize)
        .checked_mul(stride)
        .and_then(|rows| rows.checked_add(HEADER_LEN))
        .unwrap_or(usize::MAX);
    if needed > buffer.len() {
        return Err(DecodeError::SizeMismatch {
            family,
            declared,
            needed,
            available: buffer.len(),
        });
    }

    let mut records = Vec::with_capacity(declared as usize);
    let mut offset = HEADER_LEN;
    for _ in 0..declared {
        let row = &buffer[offset..offset + stride];
        let record = match family {
            AddressFamily::Ipv4 => decode_ipv4_row(row)?,
            AddressFamily::Ipv6 => decode_ipv6_row(row)?,
        };
        records.push(record);
        offset += stride;
    }

    Ok(records)
}

/// Decode one IPv4 owner-pid row
pub fn decode_ipv4_row(row: &[u8]) -> Result<ConnectionRecord, DecodeError> {
    let mut fields = RowCursor::new(AddressFamily::Ipv4, row, IPV4_ROW_LEN)?;

    let state = fields.u32();
    let local_addr = Ipv4Addr::from(fields.bytes::<4>());
    let local_port = fields.port();
    let remote_addr = Ipv4Addr::from(fields.bytes::<4>());
    let remote_port = fields.port();
    let pid = fields.u32();

    Ok(ConnectionRecord {
        local: SocketAddr::V4(SocketAddrV4::new(local_addr, local_port)),
        remote: SocketAddr::V4(SocketAddrV4::new(remote_addr, remote_port)),
        pid,
        state: ConnectionState::from_code(state),
    })
}

/// Decode one IPv6 owner-pid row, keeping both scope ids
pub fn decode_ipv6_row(row: &[u8]) -> Result<ConnectionRecord, DecodeError> {
    let mut fields = RowCursor::new(AddressFamily::Ipv6, row, IPV6_ROW_LEN)?;

    let local_addr = Ipv6Addr::from(fields.bytes::<16>());
    let local_scope = fields.u32();
    let local_port = fields.port();
    let remote_addr = Ipv6Addr::from(fields.bytes::<16>());
    let remote_scope = fields.u32();
    let remote_port = fields.port();
    let state = fields.u32();
    let pid = fields.u32();

    Ok(ConnectionRecord {
        local: SocketAddr::V6(SocketAddrV6::new(local_addr, local_port, 0, local_scope)),
        remote: SocketAddr::V6(SocketAddrV6::new(remote_addr, remote_port, 0, remote_scope)),
        pid,
        state: ConnectionState::from_code(state),
    })
}

/// Extract a port from a 32-bit port field as loaded from a little-endian row.
///
/// Only the low 16 bits carry the port, stored in network byte order; the
/// upper bits are masked off rather than trusted to be zero.
pub fn port_from_field(raw: u32) -> u16 {
    let low = (raw & 0x0000_FFFF) as u16;
    u16::from_be_bytes(low.to_le_bytes())
}

/// Sequential reader over one fixed-width row
struct RowCursor<'a> {
    row: &'a [u8],
    offset: usize,
}

impl<'a> RowCursor<'a> {
    fn new(family: AddressFamily, row: &'a [u8], expected: usize) -> Result<Self, DecodeError> {
        if row.len() != expected {
            return Err(DecodeError::RowLength {
                family,
                expected,
                actual: row.len(),
            });
        }
        Ok(Self { row, offset: 0 })
    }

    // Length was checked against the fixed layout in `new`
    fn bytes<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.row[self.offset..self.offset + N]);
        self.offset += N;
        out
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.bytes::<4>())
    }

    fn port(&mut self) -> u16 {
        port_from_field(self.u32())
    }
}

/// Builders for synthetic table buffers
#[cfg(test)]
pub(crate) mod build {
    use super::*;

    /// Port field bytes as the OS lays them out: network-order port in the low half-word
    pub(crate) fn port_field(port: u16) -> [u8; 4] {
        let [hi, lo] = port.to_be_bytes();
        [hi, lo, 0, 0]
    }

    pub(crate) fn ipv4_row(
        state: u32,
        local: (Ipv4Addr, u16),
        remote: (Ipv4Addr, u16),
        pid: u32,
    ) -> Vec<u8> {
        let mut row = Vec::with_capacity(IPV4_ROW_LEN);
        row.extend_from_slice(&state.to_le_bytes());
        row.extend_from_slice(&local.0.octets());
        row.extend_from_slice(&port_field(local.1));
        row.extend_from_slice(&remote.0.octets());
        row.extend_from_slice(&port_field(remote.1));
        row.extend_from_slice(&pid.to_le_bytes());
        row
    }

    pub(crate) fn ipv6_row(
        state: u32,
        local: (Ipv6Addr, u32, u16),
        remote: (Ipv6Addr, u32, u16),
        pid: u32,
    ) -> Vec<u8> {
        let mut row = Vec::with_capacity(IPV6_ROW_LEN);
        row.extend_from_slice(&local.0.octets());
        row.extend_from_slice(&local.1.to_le_bytes());
        row.extend_from_slice(&port_field(local.2));
        row.extend_from_slice(&remote.0.octets());
        row.extend_from_slice(&remote.1.to_le_bytes());
        row.extend_from_slice(&port_field(remote.2));
        row.extend_from_slice(&state.to_le_bytes());
        row.extend_from_slice(&pid.to_le_bytes());
        row
    }

    pub(crate) fn table(rows: &[Vec<u8>]) -> Vec<u8> {
        let mut buffer = (rows.len() as u32).to_le_bytes().to_vec();
        for row in rows {
            buffer.extend_from_slice(row);
        }
        buffer
    }
}
