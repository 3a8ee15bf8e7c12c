#![no_main]

use libfuzzer_sys::fuzz_target;
use meshalloc::slab::size_class::{object_count, object_size, size_class_index, span_pages};
use meshalloc::util::{MAX_SIZE, MIN_OBJECTS_PER_SPAN, PAGE_SIZE};

// Interprets input as a series of u32 request sizes and checks the class
// mapping: the class fits the request, the previous class does not, and the
// span geometry holds enough objects.
fuzz_target!(|data: &[u8]| {
    for chunk in data.chunks_exact(4) {
        let size = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as usize;

        let Some(class) = size_class_index(size) else {
            assert!(size > MAX_SIZE, "size {} has no class", size);
            continue;
        };
        let obj = object_size(class);
        assert!(obj >= size.max(1));
        if class > 0 {
            assert!(object_size(class - 1) < size, "size {} skipped a smaller class", size);
        }

        let span_bytes = span_pages(class) * PAGE_SIZE;
        let count = object_count(class);
        assert!(count >= MIN_OBJECTS_PER_SPAN);
        assert!(count * obj <= span_bytes);
    }
});
