// Windows IP Helper API connection table source
//
// Wraps GetExtendedTcpTable with TCP_TABLE_OWNER_PID_ALL. The call is made in
// two phases: a size query with no buffer, then a fill into a buffer of that
// size. Decoding of the returned bytes lives in `backends::decode`.

use super::{AddressFamily, FetchOutcome, TableError, TableSource};
use windows::Win32::Foundation::{ERROR_INSUFFICIENT_BUFFER, NO_ERROR};
use windows::Win32::NetworkManagement::IpHelper::{GetExtendedTcpTable, TCP_TABLE_OWNER_PID_ALL};
use windows::Win32::Networking::WinSock::{AF_INET, AF_INET6};

/// Connection table source backed by iphlpapi.dll
///
/// Available on every Windows version since XP SP2. This is the same table
/// netstat and Resource Monitor read.
pub struct IpHelperTableSource;

impl IpHelperTableSource {
    pub fn new() -> Self {
        Self
    }
}

fn address_family(family: AddressFamily) -> u32 {
    match family {
        AddressFamily::Ipv4 => AF_INET.0 as u32,
        AddressFamily::Ipv6 => AF_INET6.0 as u32,
    }
}

impl TableSource for IpHelperTableSource {
    fn name(&self) -> &'static str {
        "iphelper"
    }

    fn is_available() -> bool {
        cfg!(target_os = "windows")
    }

    fn probe(&self, family: AddressFamily) -> Result<usize, TableError> {
        let mut size: u32 = 0;
        let result = unsafe {
            GetExtendedTcpTable(
                None,
                &mut size,
                false,
                address_family(family),
                TCP_TABLE_OWNER_PID_ALL,
                0,
            )
        };

        // A size query normally answers ERROR_INSUFFICIENT_BUFFER
        if result != ERROR_INSUFFICIENT_BUFFER.0 && result != NO_ERROR.0 {
            return Err(TableError::QueryFailed {
                family,
                reason: format!("GetExtendedTcpTable size query returned error code {}", result),
            });
        }

        log::trace!("{} table probe: {} bytes", family, size);
        Ok(size as usize)
    }

    fn fetch(&self, family: AddressFamily, buffer: &mut [u8]) -> Result<FetchOutcome, TableError> {
        let mut size = u32::try_from(buffer.len()).map_err(|_| TableError::QueryFailed {
            family,
            reason: format!("buffer of {} bytes exceeds the API limit", buffer.len()),
        })?;

        let result = unsafe {
            GetExtendedTcpTable(
                Some(buffer.as_mut_ptr() as *mut _),
                &mut size,
                false,
                address_family(family),
                TCP_TABLE_OWNER_PID_ALL,
                0,
            )
        };

        if result == NO_ERROR.0 {
            Ok(FetchOutcome::Complete)
        } else if result == ERROR_INSUFFICIENT_BUFFER.0 {
            Ok(FetchOutcome::TooSmall {
                required: size as usize,
            })
        } else {
            Err(TableError::QueryFailed {
                family,
                reason: format!("GetExtendedTcpTable returned error code {}", result),
            })
        }
    }
}
