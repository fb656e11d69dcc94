use super::{FreeList, Placement};

/// Takes the lowest-offset free node that still fits once aligned.
///
/// Linear in the number of free nodes; favours speed over packing.
pub fn first_fit(
    list: &FreeList,
    aligned_size: u64,
    alignment: u64,
) -> Option<(u64, Placement)> {
    list.iter_by_offset().find_map(|(offset, size)| {
        FreeList::fit_in_node(offset, size, aligned_size, alignment)
            .map(|placement| (offset, placement))
    })
}
