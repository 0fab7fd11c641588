//! Sequential log scans.
//!
//! Walks `[from, to)` in address order, one page at a time: resident pages
//! are copied out of the ring, evicted pages are read back from the
//! device. Yields every record including tombstones and invalidated
//! records; callers filter for their purpose (recovery rebuild keeps the
//! newest address per key, tests assert on raw contents).

use std::io;
use std::marker::PhantomData;

use crate::address::Address;
use crate::device::StorageDevice;
use crate::hlog::HybridLog;
use crate::record::{Key, Record, Value};

/// One record yielded by a scan.
#[derive(Debug, Clone)]
pub struct ScannedRecord<K, V> {
    /// The record's log address.
    pub address: Address,
    /// Chain link to the next-older record.
    pub previous: Address,
    /// Whether this is a delete marker.
    pub tombstone: bool,
    /// Whether the record was invalidated (lost its index CAS).
    pub invalid: bool,
    /// The key.
    pub key: K,
    /// The value.
    pub value: V,
}

/// Iterator over the records in `[from, to)`.
pub struct LogScan<'a, K, V, D>
where
    K: Key,
    V: Value,
    D: StorageDevice,
{
    hlog: &'a HybridLog<D>,
    current: Address,
    end: Address,
    page_buf: Vec<u8>,
    buffered_page: Option<u32>,
    error: Option<io::Error>,
    _marker: PhantomData<(K, V)>,
}

impl<'a, K, V, D> LogScan<'a, K, V, D>
where
    K: Key,
    V: Value,
    D: StorageDevice,
{
    /// Scan `[from, to)` over `hlog`.
    pub fn new(hlog: &'a HybridLog<D>, from: Address, to: Address) -> Self {
        Self {
            hlog,
            current: from,
            end: to,
            page_buf: Vec::new(),
            buffered_page: None,
            error: None,
            _marker: PhantomData,
        }
    }

    /// The I/O error that stopped the scan early, if any.
    pub fn into_error(self) -> Option<io::Error> {
        self.error
    }

    fn ensure_page(&mut self, page: u32) -> bool {
        if self.buffered_page == Some(page) {
            return true;
        }
        let page_size = self.hlog.page_size();
        match self.hlog.copy_page_prefix(page, page_size) {
            Some(bytes) => {
                self.page_buf = bytes;
            }
            None => {
                // Evicted; fetch from the device.
                self.page_buf.resize(page_size, 0);
                if let Err(e) = self.hlog.read_page_from_device(page, &mut self.page_buf) {
                    self.error = Some(e);
                    return false;
                }
            }
        }
        self.buffered_page = Some(page);
        true
    }
}

impl<K, V, D> Iterator for LogScan<'_, K, V, D>
where
    K: Key,
    V: Value,
    D: StorageDevice,
{
    type Item = ScannedRecord<K, V>;

    fn next(&mut self) -> Option<Self::Item> {
        let record_size = Record::<K, V>::size() as usize;
        let page_size = self.hlog.page_size();

        loop {
            if self.current >= self.end || self.error.is_some() {
                return None;
            }

            let page = self.current.page();
            let offset = self.current.offset() as usize;

            // Records never span pages; the tail of a page past the last
            // record is allocation padding.
            if offset + record_size > page_size {
                self.current = Address::new(page + 1, 0);
                continue;
            }

            if !self.ensure_page(page) {
                return None;
            }

            let slice = &self.page_buf[offset..offset + record_size];
            match Record::<K, V>::read_from_bytes(slice) {
                Some((header, key, value)) => {
                    let address = self.current;
                    self.current = self.current.offset_by(record_size as u32);
                    return Some(ScannedRecord {
                        address,
                        previous: header.previous_address(),
                        tombstone: header.is_tombstone(),
                        invalid: header.is_invalid(),
                        key,
                        value,
                    });
                }
                None => {
                    // Null header: the rest of this page is padding.
                    self.current = Address::new(page + 1, 0);
                }
            }
        }
    }
}
