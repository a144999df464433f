//! Allocation bound of chunk reading, measured with a counting global allocator.
//! Kept in its own test binary so no other test shares the allocator.

use std::alloc::{GlobalAlloc, Layout, System};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

use u32_ext_sort::record::READ_BLOCK;
use u32_ext_sort::{ChunkBufferBuilder, RecordReader, RecordWriter, TrailingBytes, RECORD_WIDTH};

static CURRENT: AtomicUsize = AtomicUsize::new(0);
static PEAK: AtomicUsize = AtomicUsize::new(0);

struct CountingAllocator;

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if !ptr.is_null() {
            let now = CURRENT.fetch_add(layout.size(), Ordering::SeqCst) + layout.size();
            PEAK.fetch_max(now, Ordering::SeqCst);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
        CURRENT.fetch_sub(layout.size(), Ordering::SeqCst);
    }
}

#[global_allocator]
static GLOBAL: CountingAllocator = CountingAllocator;

#[test]
fn test_read_chunk_allocates_chunk_and_one_block() {
    const RECORDS: usize = 1_000_000;

    let mut writer = RecordWriter::new(Vec::new(), None);
    writer.write_all(&Vec::from_iter(0..RECORDS as u32)).unwrap();
    let bytes = writer.finish().unwrap();

    let mut reader = RecordReader::new(io::Cursor::new(bytes), TrailingBytes::Reject, None);
    let mut chunk = ChunkBufferBuilder::new(RECORDS).build();

    let baseline = CURRENT.load(Ordering::SeqCst);
    PEAK.store(baseline, Ordering::SeqCst);

    let read = reader.read_chunk(&mut chunk).unwrap();

    let extra = PEAK.load(Ordering::SeqCst) - baseline;
    let chunk_bytes = RECORDS * RECORD_WIDTH;

    assert_eq!(read, RECORDS);
    assert_eq!(chunk.capacity(), RECORDS);
    assert!(
        extra <= chunk_bytes + READ_BLOCK + 64 * 1024,
        "chunk data bytes = {}, peak extra allocation = {}",
        chunk_bytes,
        extra
    );
}
