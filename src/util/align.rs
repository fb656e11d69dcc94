/// Rounds `value` up to the next multiple of `alignment`.
///
/// `alignment` must be a power of two; zero is treated as one.
#[inline]
pub fn align_up(value: u64, alignment: u64) -> u64 {
    let alignment = alignment.max(1);
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[inline]
pub fn align_down(value: u64, alignment: u64) -> u64 {
    let alignment = alignment.max(1);
    debug_assert!(alignment.is_power_of_two());
    value & !(alignment - 1)
}

/// `alignment.max(1)`, panicking on anything that is not a power of two.
#[inline]
pub fn normalize_alignment(alignment: u64) -> u64 {
    let alignment = alignment.max(1);
    assert!(
        alignment.is_power_of_two(),
        "alignment {} is not a power of two",
        alignment
    );
    alignment
}
