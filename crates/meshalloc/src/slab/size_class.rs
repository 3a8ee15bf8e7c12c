use crate::util::{
    align_up, MAX_OBJECTS_PER_SPAN, MAX_SIZE, MIN_ALIGN, MIN_OBJECTS_PER_SPAN, PAGE_SIZE,
};

/// Size classes for the binned heap.
/// Four classes per doubling: for each power-of-two range [2^k, 2^(k+1)),
/// there are sizes at 1/4, 2/4, 3/4, and 4/4 of the range.
///
/// Classes: 16, 32, 48, 64, 80, 96, 112, 128, 160, 192, 224, 256,
///          320, 384, 448, 512, 640, 768, 896, 1024, 1280, 1536, 1792, 2048,
///          2560, 3072, 3584, 4096, 5120, 6144, 7168, 8192,
///          10240, 12288, 14336, 16384
pub const NUM_SIZE_CLASSES: usize = 36;

/// The size class table, sorted ascending.
pub static SIZE_CLASSES: [usize; NUM_SIZE_CLASSES] = {
    let mut table = [0usize; NUM_SIZE_CLASSES];
    let mut idx = 0;

    // First group: 16, 32, 48, 64
    let mut base = 0;
    while idx < 4 {
        base += 16;
        table[idx] = base;
        idx += 1;
    }

    base = 64;
    while idx < NUM_SIZE_CLASSES {
        let step = base / 4;
        let mut j = 0;
        while j < 4 && idx < NUM_SIZE_CLASSES {
            base += step;
            table[idx] = base;
            idx += 1;
            j += 1;
        }
    }

    table
};

/// Look up the size class index for a given allocation size.
/// Returns `None` if the size exceeds the largest size class.
#[inline]
pub fn size_class_index(size: usize) -> Option<usize> {
    let size = size.max(MIN_ALIGN);
    if size > MAX_SIZE {
        return None;
    }

    // Binary search for the smallest class >= size
    let idx = SIZE_CLASSES.partition_point(|&class| class < size);
    (idx < NUM_SIZE_CLASSES).then_some(idx)
}

/// Object size for a size class index.
#[inline]
pub fn object_size(class_index: usize) -> usize {
    SIZE_CLASSES[class_index]
}

/// Pages per span for a size class: one page, or enough pages to hold
/// `MIN_OBJECTS_PER_SPAN` objects when a single page holds fewer.
pub fn span_pages(class_index: usize) -> usize {
    let bytes = (object_size(class_index) * MIN_OBJECTS_PER_SPAN).max(PAGE_SIZE);
    align_up(bytes, PAGE_SIZE) / PAGE_SIZE
}

/// Objects per span for a size class, capped by the bitmap width.
pub fn object_count(class_index: usize) -> usize {
    let span_bytes = span_pages(class_index) * PAGE_SIZE;
    (span_bytes / object_size(class_index)).min(MAX_OBJECTS_PER_SPAN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_classes_are_sorted() {
        for i in 1..NUM_SIZE_CLASSES {
            assert!(
                SIZE_CLASSES[i] > SIZE_CLASSES[i - 1],
                "class {} ({}) <= class {} ({})",
                i,
                SIZE_CLASSES[i],
                i - 1,
                SIZE_CLASSES[i - 1]
            );
        }
    }

    #[test]
    fn table_bounds() {
        assert_eq!(SIZE_CLASSES[0], MIN_ALIGN);
        assert_eq!(SIZE_CLASSES[NUM_SIZE_CLASSES - 1], MAX_SIZE);
        for &sz in &SIZE_CLASSES {
            assert_eq!(sz % MIN_ALIGN, 0, "class {} not aligned to {}", sz, MIN_ALIGN);
        }
    }

    #[test]
    fn lookup_boundary_sizes() {
        assert_eq!(size_class_index(0), Some(0));
        assert_eq!(size_class_index(16), Some(0));
        assert_eq!(size_class_index(17), Some(1));
        assert_eq!(size_class_index(MAX_SIZE), Some(NUM_SIZE_CLASSES - 1));
        assert_eq!(size_class_index(MAX_SIZE + 1), None);
    }

    #[test]
    fn span_geometry() {
        for class in 0..NUM_SIZE_CLASSES {
            let count = object_count(class);
            assert!(count >= MIN_OBJECTS_PER_SPAN, "class {} holds {}", class, count);
            assert!(count <= MAX_OBJECTS_PER_SPAN);
            assert!(count * object_size(class) <= span_pages(class) * PAGE_SIZE);
        }

        let c16 = size_class_index(16).unwrap();
        assert_eq!((span_pages(c16), object_count(c16)), (1, 256));

        let c512 = size_class_index(512).unwrap();
        assert_eq!((span_pages(c512), object_count(c512)), (1, 8));

        let c16k = size_class_index(MAX_SIZE).unwrap();
        assert_eq!((span_pages(c16k), object_count(c16k)), (32, 8));
    }
}
