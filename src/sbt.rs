//! Shader binding table record layout.
//!
//! Every record is a fixed-size opaque header (packed by the backend from a
//! program group) followed by a fixed-size payload. Hit-group records carry
//! exactly two 32-bit user tags; all other categories are header-only.

use bytemuck::{Pod, Zeroable};

/// Size of the opaque program-group header at the start of every record.
pub const RECORD_HEADER_SIZE: usize = 32;

/// Required alignment of every record, and of the table base address.
pub const RECORD_ALIGNMENT: usize = 16;

/// Payload of a hit-group record: the material's user tag and the geometry
/// instance's user tag, both indices into caller-managed data arrays.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct HitGroupRecordData {
    pub material_data: u32,
    pub geometry_instance_data: u32,
}

/// Byte stride of one hit-group record: header plus payload, rounded up to
/// the record alignment.
pub const HIT_GROUP_RECORD_STRIDE: usize = align_up(
    RECORD_HEADER_SIZE + std::mem::size_of::<HitGroupRecordData>(),
    RECORD_ALIGNMENT,
);

/// Byte stride of a header-only record (ray generation, exception, miss,
/// callable).
pub const HEADER_ONLY_RECORD_STRIDE: usize = align_up(RECORD_HEADER_SIZE, RECORD_ALIGNMENT);

pub(crate) const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strides_match_native_abi() {
        assert_eq!(HIT_GROUP_RECORD_STRIDE, 48);
        assert_eq!(HEADER_ONLY_RECORD_STRIDE, 32);
        assert_eq!(std::mem::size_of::<HitGroupRecordData>(), 8);
    }

    #[test]
    fn align_up_rounds_to_the_next_boundary() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(40, 16), 48);
        assert_eq!(align_up(48, 16), 48);
    }
}
