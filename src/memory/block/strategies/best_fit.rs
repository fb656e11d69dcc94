use super::{FreeList, Placement};

/// Takes the smallest free node that fits once aligned.
///
/// The size index is walked upward from `aligned_size`, so the first hit is
/// the tightest node that can hold the request plus its alignment padding.
pub fn best_fit(
    list: &FreeList,
    aligned_size: u64,
    alignment: u64,
) -> Option<(u64, Placement)> {
    list.iter_by_size_from(aligned_size)
        .find_map(|(offset, size)| {
            FreeList::fit_in_node(offset, size, aligned_size, alignment)
                .map(|placement| (offset, placement))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_fit_takes_smallest_node() {
        let mut list = FreeList::default();
        list.insert_coalesced(0, 500);
        list.insert_coalesced(600, 50);

        let (node, placement) = best_fit(&list, 40, 1).unwrap();
        assert_eq!(node, 600);
        assert_eq!(placement.offset, 600);
    }

    #[test]
    fn test_best_fit_skips_nodes_too_small_after_padding() {
        let mut list = FreeList::default();
        // 40 bytes aligned to 64 do not fit in [10, 60).
        list.insert_coalesced(10, 50);
        list.insert_coalesced(100, 300);

        let (node, placement) = best_fit(&list, 40, 64).unwrap();
        assert_eq!(node, 100);
        assert_eq!(placement.offset, 128);
    }
}
