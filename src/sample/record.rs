//! Ring-buffer record parsing, kept free of the mmap so it can run on
//! plain byte slices.

use crate::ffi::bindings as b;
use crate::ffi::deref_offset;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Record {
    /// PERF_RECORD_SAMPLE with `sample_type == PERF_SAMPLE_IP`.
    Sample { ip: u64 },
    /// The kernel dropped records because the buffer was full.
    Lost { id: u64, count: u64 },
    Unknown { ty: u32 },
}

/// Copies `out.len()` bytes starting at ring offset `offset`, rejoining
/// a record that straddles the end of the buffer.
pub(crate) fn copy_wrapped(data: &[u8], mask: u64, offset: u64, out: &mut [u8]) {
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = data[(offset.wrapping_add(i as u64) & mask) as usize];
    }
}

fn load_u64(data: &[u8], mask: u64, offset: u64) -> u64 {
    let mut bytes = [0u8; 8];
    copy_wrapped(data, mask, offset, &mut bytes);
    u64::from_ne_bytes(bytes)
}

/// Walks records from `tail` up to `head`, feeding each to `visit`, and
/// returns the new tail.
///
/// Offsets are monotonically increasing byte positions; only the
/// mask-wrapped low bits index into `data`. A header whose size cannot
/// advance the cursor would loop forever, so the walk bails to `head`.
pub(crate) fn walk_records(
    data: &[u8],
    mask: u64,
    mut tail: u64,
    head: u64,
    mut visit: impl FnMut(Record),
) -> u64 {
    while tail < head {
        let mut header = [0u8; size_of::<b::perf_event_header>()];
        copy_wrapped(data, mask, tail, &mut header);
        let mut ptr = header.as_ptr();
        let ty: u32 = unsafe { deref_offset(&mut ptr) };
        let _misc: u16 = unsafe { deref_offset(&mut ptr) };
        let size: u16 = unsafe { deref_offset(&mut ptr) };
        if (size as usize) < size_of::<b::perf_event_header>() {
            return head;
        }

        let record = match ty {
            b::PERF_RECORD_SAMPLE => Record::Sample {
                ip: load_u64(data, mask, tail + 8),
            },
            b::PERF_RECORD_LOST => Record::Lost {
                id: load_u64(data, mask, tail + 8),
                count: load_u64(data, mask, tail + 16),
            },
            ty => Record::Unknown { ty },
        };
        visit(record);
        tail += size as u64;
    }
    tail
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_u64(ring: &mut [u8], mask: u64, offset: u64, value: u64) {
        for (i, byte) in value.to_ne_bytes().into_iter().enumerate() {
            ring[((offset + i as u64) & mask) as usize] = byte;
        }
    }

    fn put_header(ring: &mut [u8], mask: u64, offset: u64, ty: u32, size: u16) {
        for (i, byte) in ty.to_ne_bytes().into_iter().enumerate() {
            ring[((offset + i as u64) & mask) as usize] = byte;
        }
        // misc stays zero.
        for (i, byte) in size.to_ne_bytes().into_iter().enumerate() {
            ring[((offset + 6 + i as u64) & mask) as usize] = byte;
        }
    }

    #[test]
    fn wrapped_copy_rejoins_bytes() {
        let mut ring = vec![0u8; 16];
        let mask = 15;
        for (i, byte) in ring.iter_mut().enumerate() {
            *byte = i as u8;
        }
        let mut out = [0u8; 6];
        copy_wrapped(&ring, mask, 13, &mut out);
        assert_eq!(out, [13, 14, 15, 0, 1, 2]);
    }

    #[test]
    fn sample_record_parses() {
        let mut ring = vec![0u8; 64];
        let mask = 63;
        put_header(&mut ring, mask, 0, b::PERF_RECORD_SAMPLE, 16);
        put_u64(&mut ring, mask, 8, 0xdead_beef);

        let mut seen = Vec::new();
        let tail = walk_records(&ring, mask, 0, 16, |r| seen.push(r));
        assert_eq!(tail, 16);
        assert_eq!(seen, vec![Record::Sample { ip: 0xdead_beef }]);
    }

    #[test]
    fn record_straddling_the_end_reassembles() {
        let mut ring = vec![0u8; 64];
        let mask = 63;
        // Header at offset 56, payload wraps to the start of the ring.
        put_header(&mut ring, mask, 56, b::PERF_RECORD_SAMPLE, 16);
        put_u64(&mut ring, mask, 64, 0x1234_5678_9abc_def0);

        let mut seen = Vec::new();
        let tail = walk_records(&ring, mask, 56, 72, |r| seen.push(r));
        assert_eq!(tail, 72);
        assert_eq!(
            seen,
            vec![Record::Sample {
                ip: 0x1234_5678_9abc_def0
            }]
        );
    }

    #[test]
    fn lost_and_unknown_records_flow_through() {
        let mut ring = vec![0u8; 128];
        let mask = 127;
        put_header(&mut ring, mask, 0, b::PERF_RECORD_LOST, 24);
        put_u64(&mut ring, mask, 8, 7);
        put_u64(&mut ring, mask, 16, 42);
        put_header(&mut ring, mask, 24, 77, 8);
        put_header(&mut ring, mask, 32, b::PERF_RECORD_SAMPLE, 16);
        put_u64(&mut ring, mask, 40, 0xabcd);

        let mut seen = Vec::new();
        let tail = walk_records(&ring, mask, 0, 48, |r| seen.push(r));
        assert_eq!(tail, 48);
        assert_eq!(
            seen,
            vec![
                Record::Lost { id: 7, count: 42 },
                Record::Unknown { ty: 77 },
                Record::Sample { ip: 0xabcd },
            ]
        );
    }

    #[test]
    fn zero_sized_header_bails_to_head() {
        let ring = vec![0u8; 64];
        let mut seen = Vec::new();
        let tail = walk_records(&ring, 63, 0, 32, |r| seen.push(r));
        assert_eq!(tail, 32);
        assert!(seen.is_empty());
    }
}
