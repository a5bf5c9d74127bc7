//! Host-key trust store interface.
//!
//! The actual known-hosts file parsing is external to the core; the
//! kex engine only needs a lookup verdict per offered key.

use std::collections::HashMap;

/// Verdict for a host key offered during key exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostStatus {
    /// The key matches the recorded one.
    Ok,
    /// No key is recorded for this host.
    New,
    /// A different key is recorded; possible man-in-the-middle.
    Changed,
}

pub trait HostKeyStore {
    /// Consulted once per key exchange with the server's offered key.
    fn lookup(&mut self, hostname: &str, key_blob: &[u8]) -> HostStatus;
}

/// An in-memory store that records first-seen keys.
#[derive(Default)]
pub struct MemoryHostKeyStore {
    known: HashMap<String, Vec<u8>>,
}

impl HostKeyStore for MemoryHostKeyStore {
    fn lookup(&mut self, hostname: &str, key_blob: &[u8]) -> HostStatus {
        match self.known.get(hostname) {
            Some(recorded) if recorded == key_blob => HostStatus::Ok,
            Some(_) => HostStatus::Changed,
            None => {
                self.known.insert(hostname.to_owned(), key_blob.to_vec());
                HostStatus::New
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_detects_changes() {
        let mut store = MemoryHostKeyStore::default();
        assert_eq!(store.lookup("host", b"key1"), HostStatus::New);
        assert_eq!(store.lookup("host", b"key1"), HostStatus::Ok);
        assert_eq!(store.lookup("host", b"key2"), HostStatus::Changed);
    }
}
