use pakstream_base::SymbolIndex;
use std::collections::VecDeque;

/// A merged read never grows past this, no matter how many symbol ranges it
/// would absorb.
pub const MAX_MERGED_READ: u64 = 1024 * 1024;
/// Two ranges separated by more than this are read separately; below it the
/// seek costs more than the wasted bytes.
pub const MAX_GAP_SKIP: u64 = 48 * 1024;
/// Reads are padded up to this floor. Also the size of the header probe at
/// the start of a file.
pub const MIN_READ_SIZE: u64 = 64 * 1024;

/// One symbol's payload location, as recorded in the export table.
#[derive(Copy, Clone, Debug)]
pub struct SymbolRange {
    /// Null for reads not tied to a symbol (the header probe).
    pub symbol: SymbolIndex,
    pub file_offset: u64,
    pub len: u64,
}

/// A read the owner must hand to the I/O pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IssuedRead {
    pub file_offset: u64,
    pub len: u64,
}

struct PendingRead {
    file_offset: u64,
    len: u64,
    covered: Vec<SymbolIndex>,
}

impl PendingRead {
    fn end(&self) -> u64 {
        self.file_offset + self.len
    }

    fn covers(
        &self,
        file_offset: u64,
        len: u64,
    ) -> bool {
        file_offset >= self.file_offset && file_offset + len <= self.end()
    }
}

struct ResidentRange {
    file_offset: u64,
    data: Vec<u8>,
}

/// Per-task chunked read cache.
///
/// Holds at most one resident byte range and at most one in-flight read at a
/// time; further coalesced reads queue behind it. Completing a read replaces
/// the resident range wholesale, so a symbol may only be deserialized between
/// the completion that covers it and the next completion. The scheduler's
/// serialize ordering guarantees that window; `resident_slice` is the
/// containment check that catches it being violated.
#[derive(Default)]
pub struct PrecacheCache {
    resident: Option<ResidentRange>,
    in_flight: Option<PendingRead>,
    queued: VecDeque<PendingRead>,
    file_size: Option<u64>,
}

impl PrecacheCache {
    /// Known after the first read completes.
    pub fn file_size(&self) -> Option<u64> {
        self.file_size
    }

    pub fn is_range_resident(
        &self,
        file_offset: u64,
        len: u64,
    ) -> bool {
        self.resident_slice(file_offset, len).is_some()
    }

    /// The containment check. Returns the bytes for a range only if the whole
    /// range sits inside the currently resident data.
    pub fn resident_slice(
        &self,
        file_offset: u64,
        len: u64,
    ) -> Option<&[u8]> {
        let resident = self.resident.as_ref()?;
        if file_offset < resident.file_offset {
            return None;
        }
        let start = (file_offset - resident.file_offset) as usize;
        let end = start.checked_add(len as usize)?;
        resident.data.get(start..end)
    }

    pub fn has_outstanding(&self) -> bool {
        self.in_flight.is_some() || !self.queued.is_empty()
    }

    /// Queues coalesced reads for every range not already resident or covered
    /// by a pending read. Ranges already resident are skipped entirely; the
    /// caller is expected to have fired their symbols before asking. Call
    /// [`Self::take_next_read`] afterwards to get work for the I/O pool.
    pub fn request_ranges(
        &mut self,
        ranges: &[SymbolRange],
    ) {
        let mut sorted: Vec<SymbolRange> = ranges.to_vec();
        sorted.sort_by_key(|r| r.file_offset);

        let mut building: Option<PendingRead> = None;
        for range in sorted {
            if self.is_range_resident(range.file_offset, range.len) {
                continue;
            }
            if let Some(pending) = self.find_pending_covering(range.file_offset, range.len) {
                if !range.symbol.is_null() {
                    pending.covered.push(range.symbol);
                }
                continue;
            }
            if let Some(read) = building.as_mut() {
                if read.covers(range.file_offset, range.len) {
                    if !range.symbol.is_null() {
                        read.covered.push(range.symbol);
                    }
                    continue;
                }
                let new_end = range.file_offset + range.len;
                let gap = range.file_offset.saturating_sub(read.end());
                if gap <= MAX_GAP_SKIP && new_end - read.file_offset <= MAX_MERGED_READ {
                    read.len = new_end - read.file_offset;
                    if !range.symbol.is_null() {
                        read.covered.push(range.symbol);
                    }
                    continue;
                }
                let finished = building.take().unwrap();
                self.queue_read(finished);
            }
            let covered = if range.symbol.is_null() {
                Vec::default()
            } else {
                vec![range.symbol]
            };
            building = Some(PendingRead {
                file_offset: range.file_offset,
                len: range.len,
                covered,
            });
        }
        if let Some(read) = building {
            self.queue_read(read);
        }
    }

    /// The in-flight or queued read, if any, that fully covers a range.
    fn find_pending_covering(
        &mut self,
        file_offset: u64,
        len: u64,
    ) -> Option<&mut PendingRead> {
        self.in_flight
            .iter_mut()
            .chain(self.queued.iter_mut())
            .find(|p| p.covers(file_offset, len))
    }

    fn queue_read(
        &mut self,
        mut read: PendingRead,
    ) {
        if read.len < MIN_READ_SIZE {
            read.len = MIN_READ_SIZE;
        }
        log::trace!(
            "queue read [{}, +{}) covering {} symbols",
            read.file_offset,
            read.len,
            read.covered.len()
        );
        self.queued.push_back(read);
    }

    /// Moves the next queued read into flight, if nothing is in flight yet.
    pub fn take_next_read(&mut self) -> Option<IssuedRead> {
        if self.in_flight.is_some() {
            return None;
        }
        let next = self.queued.pop_front()?;
        let issued = IssuedRead {
            file_offset: next.file_offset,
            len: next.len,
        };
        self.in_flight = Some(next);
        Some(issued)
    }

    /// Installs completed bytes as the one resident range and returns the
    /// symbols the read (and any queued read it subsumed) was covering.
    /// A completion that matches nothing in flight was flushed; it installs
    /// nothing and covers nothing.
    pub fn complete_read(
        &mut self,
        file_offset: u64,
        requested_len: u64,
        data: Vec<u8>,
        file_size: u64,
    ) -> Vec<SymbolIndex> {
        self.file_size = Some(file_size);

        let matches = self
            .in_flight
            .as_ref()
            .map(|p| p.file_offset == file_offset && p.len == requested_len)
            .unwrap_or(false);
        if !matches {
            log::warn!(
                "dropping read completion [{}, +{}) with no pending read",
                file_offset,
                requested_len
            );
            return Vec::default();
        }

        let mut covered = self.in_flight.take().unwrap().covered;
        self.resident = Some(ResidentRange { file_offset, data });

        // Queued reads fully inside the new resident range never need to hit
        // disk; surface their symbols now.
        let resident_len = self.resident.as_ref().unwrap().data.len() as u64;
        let mut kept = VecDeque::with_capacity(self.queued.len());
        for mut pending in self.queued.drain(..) {
            if pending.file_offset >= file_offset && pending.end() <= file_offset + resident_len
            {
                covered.append(&mut pending.covered);
            } else {
                kept.push_back(pending);
            }
        }
        self.queued = kept;

        covered
    }

    /// Drops resident data and all queued work. An in-flight read keeps
    /// running but its completion will be ignored.
    pub fn flush(&mut self) {
        self.resident = None;
        self.in_flight = None;
        self.queued.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn range(
        export: usize,
        file_offset: u64,
        len: u64,
    ) -> SymbolRange {
        SymbolRange {
            symbol: SymbolIndex::from_export(export),
            file_offset,
            len,
        }
    }

    #[test]
    fn nearby_ranges_coalesce_into_one_read() {
        let mut cache = PrecacheCache::default();
        cache.request_ranges(&[
            range(0, 1000, 500),
            range(1, 2000, 500),
            // Inside the gap-extended span of the first two
            range(2, 1600, 100),
        ]);

        let read = cache.take_next_read().unwrap();
        assert_eq!(read.file_offset, 1000);
        assert_eq!(read.len, MIN_READ_SIZE);
        assert!(cache.take_next_read().is_none());

        let covered = cache.complete_read(1000, MIN_READ_SIZE, vec![0; MIN_READ_SIZE as usize], 1 << 20);
        assert_eq!(covered.len(), 3);
    }

    #[test]
    fn wide_gap_splits_reads() {
        let mut cache = PrecacheCache::default();
        cache.request_ranges(&[
            range(0, 0, 100_000),
            range(1, 100_000 + MAX_GAP_SKIP + 1, 100_000),
        ]);

        let first = cache.take_next_read().unwrap();
        assert_eq!(first.file_offset, 0);
        assert_eq!(first.len, 100_000);
        // One read in flight at a time
        assert!(cache.take_next_read().is_none());

        let covered = cache.complete_read(0, first.len, vec![0; first.len as usize], 1 << 20);
        assert_eq!(covered, vec![SymbolIndex::from_export(0)]);

        let second = cache.take_next_read().unwrap();
        assert_eq!(second.file_offset, 100_000 + MAX_GAP_SKIP + 1);
    }

    #[test]
    fn merged_read_respects_size_cap() {
        let mut cache = PrecacheCache::default();
        cache.request_ranges(&[
            range(0, 0, 600 * 1024),
            // Adjacent but would push the merge past the cap
            range(1, 600 * 1024, 600 * 1024),
        ]);

        let first = cache.take_next_read().unwrap();
        assert_eq!(first.len, 600 * 1024);
        let covered = cache.complete_read(0, first.len, vec![0; first.len as usize], 4 << 20);
        assert_eq!(covered, vec![SymbolIndex::from_export(0)]);
        assert!(cache.take_next_read().is_some());
    }

    #[test]
    fn pending_read_absorbs_covered_range() {
        let mut cache = PrecacheCache::default();
        cache.request_ranges(&[range(0, 0, 4096)]);
        let read = cache.take_next_read().unwrap();

        // Fully inside the in-flight read; no second read, symbol rides along.
        cache.request_ranges(&[range(1, 1024, 512)]);
        assert!(cache.has_outstanding());
        let covered = cache.complete_read(0, read.len, vec![0; read.len as usize], 1 << 20);
        assert_eq!(covered.len(), 2);
        assert!(!cache.has_outstanding());
    }

    #[test]
    fn completion_replaces_resident_range() {
        let mut cache = PrecacheCache::default();
        cache.request_ranges(&[range(0, 0, 128)]);
        let read = cache.take_next_read().unwrap();
        cache.complete_read(0, read.len, vec![1; read.len as usize], 1 << 20);
        assert!(cache.is_range_resident(0, 128));

        cache.request_ranges(&[range(1, 2 << 20, 128)]);
        let read = cache.take_next_read().unwrap();
        cache.complete_read(read.file_offset, read.len, vec![2; read.len as usize], 4 << 20);
        assert!(!cache.is_range_resident(0, 128));
        assert_eq!(
            cache.resident_slice(2 << 20, 128).unwrap(),
            &[2u8; 128][..]
        );
    }

    #[test]
    fn flush_ignores_late_completion() {
        let mut cache = PrecacheCache::default();
        cache.request_ranges(&[range(0, 0, 128)]);
        let read = cache.take_next_read().unwrap();
        cache.flush();
        let covered = cache.complete_read(0, read.len, vec![0; read.len as usize], 1 << 20);
        assert!(covered.is_empty());
        assert!(cache.resident_slice(0, 1).is_none());
    }
}
