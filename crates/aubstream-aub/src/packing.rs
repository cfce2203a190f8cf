use core::ops::Range;

use aubstream_types::PageInfo;

use crate::format::MAX_RECORD_DWORDS;

/// Most address/size entries one discontiguous record may carry.
pub const MAX_DISCONTIGUOUS_ENTRIES: usize = 128;

/// Flags and entry count.
const DISCONTIGUOUS_FIXED_DWORDS: usize = 2;
const DISCONTIGUOUS_ENTRY_DWORDS: usize = 3;

/// One record-level step of a discontiguous write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackStep {
    /// Entries written together in one discontiguous record.
    Batch(Range<usize>),
    /// One entry written through the contiguous path.
    Single(usize),
}

/// Splits `entries` into records with a single forward scan.
///
/// An entry joins the running batch when its size and address are dword aligned, its locality
/// matches the first entry of the call, and it fits in a record on its own. A batch is closed
/// before it would exceed [`MAX_DISCONTIGUOUS_ENTRIES`] or the 16-bit dword count. An ineligible
/// entry closes the running batch and is then written on its own. A batch that ends up with a
/// single entry is written through the contiguous path as well.
pub fn plan(entries: &[PageInfo]) -> Vec<PackStep> {
    let mut steps = Vec::new();
    if entries.len() == 1 {
        steps.push(PackStep::Single(0));
        return steps;
    }
    let Some(first) = entries.first() else {
        return steps;
    };
    let local = first.is_local();

    let mut batch = Batch::default();
    for (index, entry) in entries.iter().enumerate() {
        if !eligible(entry, local) {
            batch.flush(&mut steps);
            steps.push(PackStep::Single(index));
            continue;
        }
        if batch.len > 0
            && (batch.len == MAX_DISCONTIGUOUS_ENTRIES
                || record_dwords(batch.len + 1, batch.bytes + entry.size) > MAX_RECORD_DWORDS)
        {
            batch.flush(&mut steps);
        }
        batch.push(index, entry.size);
    }
    batch.flush(&mut steps);
    steps
}

/// Payload dwords of a discontiguous record holding `entries` entries and `bytes` of data.
pub(crate) fn record_dwords(entries: usize, bytes: usize) -> usize {
    DISCONTIGUOUS_FIXED_DWORDS + DISCONTIGUOUS_ENTRY_DWORDS * entries + bytes / 4
}

fn eligible(entry: &PageInfo, local: bool) -> bool {
    entry.size % 4 == 0
        && entry.phys_address % 4 == 0
        && entry.is_local() == local
        && record_dwords(1, entry.size) <= MAX_RECORD_DWORDS
}

#[derive(Default)]
struct Batch {
    start: usize,
    len: usize,
    bytes: usize,
}

impl Batch {
    fn push(&mut self, index: usize, size: usize) {
        if self.len == 0 {
            self.start = index;
        }
        self.len += 1;
        self.bytes += size;
    }

    fn flush(&mut self, steps: &mut Vec<PackStep>) {
        match self.len {
            0 => {}
            1 => steps.push(PackStep::Single(self.start)),
            len => steps.push(PackStep::Batch(self.start..self.start + len)),
        }
        *self = Batch::default();
    }
}

#[cfg(test)]
mod tests {
    use aubstream_types::MemoryBank;

    use super::*;

    fn system(phys: u64, size: usize) -> PageInfo {
        PageInfo::new(phys, size, MemoryBank::SYSTEM)
    }

    fn local(phys: u64, size: usize) -> PageInfo {
        PageInfo::new(phys, size, MemoryBank::local(0))
    }

    #[test]
    fn aligned_unaligned_and_foreign_bank() {
        let entries = [
            system(0x1000, 0x1000),
            system(0x5000, 0x1000),
            system(0x9000, 0x1000),
            system(0xA001, 0x0FFF),
            local(0x4000_0000, 0x1000),
        ];
        assert_eq!(
            plan(&entries),
            vec![PackStep::Batch(0..3), PackStep::Single(3), PackStep::Single(4)]
        );
    }

    #[test]
    fn single_entry_always_takes_contiguous_path() {
        assert_eq!(plan(&[system(0x1000, 0x1000)]), vec![PackStep::Single(0)]);
        assert_eq!(plan(&[system(0x1003, 0x11)]), vec![PackStep::Single(0)]);
        assert!(plan(&[]).is_empty());
    }

    #[test]
    fn ineligible_entry_splits_batches() {
        let entries = [
            system(0x1000, 0x100),
            system(0x2000, 0x100),
            system(0x3002, 0x100),
            system(0x4000, 0x100),
            system(0x5000, 0x100),
        ];
        assert_eq!(
            plan(&entries),
            vec![
                PackStep::Batch(0..2),
                PackStep::Single(2),
                PackStep::Batch(3..5)
            ]
        );
    }

    #[test]
    fn lone_survivor_between_ineligibles_goes_contiguous() {
        let entries = [
            system(0x1001, 0x100),
            system(0x2000, 0x100),
            system(0x3000, 0x102),
        ];
        assert_eq!(
            plan(&entries),
            vec![PackStep::Single(0), PackStep::Single(1), PackStep::Single(2)]
        );
    }

    #[test]
    fn locality_is_taken_from_first_entry() {
        let entries = [
            local(0x4000_0000, 0x1000),
            system(0x1000, 0x1000),
            local(0x4000_1000, 0x1000),
            local(0x4000_2000, 0x1000),
        ];
        assert_eq!(
            plan(&entries),
            vec![PackStep::Single(0), PackStep::Single(1), PackStep::Batch(2..4)]
        );
    }

    #[test]
    fn entry_count_limit_binds() {
        let entries: Vec<PageInfo> = (0..300u64).map(|i| system(i * 0x1000, 4)).collect();
        assert_eq!(
            plan(&entries),
            vec![
                PackStep::Batch(0..128),
                PackStep::Batch(128..256),
                PackStep::Batch(256..300)
            ]
        );
    }

    #[test]
    fn dword_limit_binds() {
        // Each entry is 0x10000 bytes = 0x4000 dwords; three fit (2 + 9 + 0xC000), the fourth
        // would push the count past 0xFFFF.
        let entries: Vec<PageInfo> = (0..5u64).map(|i| system(i * 0x10000, 0x10000)).collect();
        let steps = plan(&entries);
        assert_eq!(steps, vec![PackStep::Batch(0..3), PackStep::Batch(3..5)]);
        for step in steps {
            if let PackStep::Batch(range) = step {
                let bytes: usize = entries[range.clone()].iter().map(|e| e.size).sum();
                assert!(record_dwords(range.len(), bytes) <= MAX_RECORD_DWORDS);
            }
        }
    }

    #[test]
    fn oversized_entry_takes_contiguous_path() {
        let entries = [
            system(0x1000, 0x1000),
            system(0x10_0000, 0x4_0000),
            system(0x2000, 0x1000),
        ];
        assert_eq!(
            plan(&entries),
            vec![PackStep::Single(0), PackStep::Single(1), PackStep::Single(2)]
        );
    }
}
