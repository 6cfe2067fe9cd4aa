// SPDX-License-Identifier: MPL-2.0

use alloc::{collections::VecDeque, vec::Vec};

use spin::Mutex;

/// The number of records that a [`HistoryLog`] keeps.
pub const MAX_HISTORY_BUFF: usize = 256;

/// One mapped or unmapped chunk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HistoryRecord {
    /// The address of the chunk.
    pub addr: u64,
    /// The address passed by the caller.
    pub orig_addr: u64,
    /// The size of the request after alignment.
    pub size: usize,
    /// The size passed by the caller.
    pub orig_size: usize,
}

/// A ring of the latest chunk records, kept for post-mortem debugging.
pub struct HistoryLog {
    records: Mutex<VecDeque<HistoryRecord>>,
}

impl HistoryLog {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(MAX_HISTORY_BUFF)),
        }
    }

    pub(crate) fn push(&self, record: HistoryRecord) {
        let mut records = self.records.lock();
        if records.len() == MAX_HISTORY_BUFF {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Returns the records, oldest first.
    pub fn records(&self) -> Vec<HistoryRecord> {
        self.records.lock().iter().copied().collect()
    }
}

impl Default for HistoryLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn record(addr: u64) -> HistoryRecord {
        HistoryRecord {
            addr,
            ..Default::default()
        }
    }

    #[test]
    fn oldest_records_are_overwritten() {
        let log = HistoryLog::new();
        for addr in 0..(MAX_HISTORY_BUFF as u64 + 3) {
            log.push(record(addr));
        }
        let records = log.records();
        assert_eq!(records.len(), MAX_HISTORY_BUFF);
        assert_eq!(records[0].addr, 3);
        assert_eq!(records.last().map(|r| r.addr), Some(MAX_HISTORY_BUFF as u64 + 2));
    }
}
