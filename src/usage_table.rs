//! Per security level usage table header.
//!
//! Devices with per-entry usage accounting keep one signed header that
//! indexes every usage entry. The header is owned by the process (one per
//! security level, see [`CryptoContext`](crate::crypto_session::CryptoContext))
//! and every crypto session at that level updates it through its own handle.
use parking_lot::Mutex;

use crate::boundary::RequestedSecurityLevel;
use crate::crypto_session::CryptoSession;
use crate::error::Result;

/// Shared usage table header for one security level.
#[derive(Debug)]
pub struct UsageTableHeader {
    security_level: RequestedSecurityLevel,
    inner: Mutex<HeaderState>,
}

#[derive(Debug, Default)]
struct HeaderState {
    header: Vec<u8>,
    entry_count: u32,
}

impl UsageTableHeader {
    /// Create a fresh header in the boundary.
    pub fn init(security_level: RequestedSecurityLevel, session: &CryptoSession) -> Result<Self> {
        let header = session.create_usage_table_header(security_level)?;
        debug!(
            "created usage table header: level={:?} size={}",
            security_level,
            header.len()
        );
        Ok(Self {
            security_level,
            inner: Mutex::new(HeaderState {
                header,
                entry_count: 0,
            }),
        })
    }

    /// Restore a previously stored header holding `entry_count` entries.
    pub fn restore(
        security_level: RequestedSecurityLevel,
        session: &CryptoSession,
        header: Vec<u8>,
        entry_count: u32,
    ) -> Result<Self> {
        session.load_usage_table_header(security_level, &header)?;
        Ok(Self {
            security_level,
            inner: Mutex::new(HeaderState {
                header,
                entry_count,
            }),
        })
    }

    pub fn security_level(&self) -> RequestedSecurityLevel {
        self.security_level
    }

    /// Current signed header bytes.
    pub fn header(&self) -> Vec<u8> {
        self.inner.lock().header.clone()
    }

    pub fn entry_count(&self) -> u32 {
        self.inner.lock().entry_count
    }

    /// Allocate a usage entry for `session`. Returns its index.
    pub fn add_entry(&self, session: &CryptoSession) -> Result<u32> {
        let mut inner = self.inner.lock();
        let index = session.create_usage_entry()?;
        inner.entry_count = inner.entry_count.max(index + 1);
        Ok(index)
    }

    /// Load a stored entry into `session`.
    pub fn load_entry(&self, session: &CryptoSession, index: u32, entry: &[u8]) -> Result<()> {
        let _inner = self.inner.lock();
        session.load_usage_entry(index, entry)
    }

    /// Re-sign the entry loaded in `session`. Stores the new header and
    /// returns the new entry bytes.
    pub fn update_entry(&self, session: &CryptoSession) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        let (header, entry) = session.update_usage_entry()?;
        inner.header = header;
        Ok(entry)
    }

    /// Drop trailing entries so that `entry_count` remain.
    pub fn shrink(&self, session: &CryptoSession, entry_count: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        let header = session.shrink_usage_table_header(self.security_level, entry_count)?;
        inner.header = header;
        inner.entry_count = entry_count;
        Ok(())
    }
}
