//! Taint bitmasks encode argument positions MSB-first: bit 31 is argument 1,
//! bit 30 is argument 2, and so on down to bit 1 for argument 31. Bit 0 is
//! never used.

/// Highest argument position a taint bitmask can represent
pub const MAX_ARG_POSITION: u32 = 31;

/// Given the taint bits of a call site before (`in_bits`) and after
/// (`out_bits`) the call, return the 1-based position of the argument the
/// call newly tainted, or `None` if it tainted no new argument.
///
/// If several arguments were newly tainted, the lowest position (highest
/// bit) wins.
pub fn newly_tainted_arg(in_bits: u32, out_bits: u32) -> Option<u32> {
    let newly_tainted = out_bits & !in_bits & encodable_mask();
    if newly_tainted == 0 {
        None
    } else {
        Some(newly_tainted.leading_zeros() + 1)
    }
}

/// The bit encoding the given 1-based argument position, or `None` if the
/// position can't be encoded.
pub fn arg_bit(position: u32) -> Option<u32> {
    if (1 ..= MAX_ARG_POSITION).contains(&position) {
        Some(1 << (32 - position))
    } else {
        None
    }
}

/// Iterate over every argument position set in `bits`, in ascending order.
pub fn tainted_args(bits: u32) -> impl Iterator<Item = u32> {
    (1 ..= MAX_ARG_POSITION).filter(move |&position| bits & (1 << (32 - position)) != 0)
}

fn encodable_mask() -> u32 {
    !1
}
