//! Offset alignment utilities.
//!
//! Device memory alignments reported by the driver are not required to be
//! powers of two in every code path, so these helpers use modulo arithmetic.

use ash::vk;

/// Align an offset up to the given alignment.
///
/// An alignment of 0 is treated like 1.
#[inline]
pub const fn align_up(offset: vk::DeviceSize, align: vk::DeviceSize) -> vk::DeviceSize {
    offset + padding_for(offset, align)
}

/// Bytes that must be skipped to bring `offset` onto `align`.
#[inline]
pub const fn padding_for(offset: vk::DeviceSize, align: vk::DeviceSize) -> vk::DeviceSize {
    if align <= 1 {
        return 0;
    }
    (align - offset % align) % align
}

/// Size in bytes of a slice of plain values, as a device size.
#[inline]
pub fn byte_len<T>(items: &[T]) -> vk::DeviceSize {
    std::mem::size_of_val(items) as vk::DeviceSize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(9, 8), 16);
        assert_eq!(align_up(7, 0), 7);
    }

    #[test]
    fn test_padding_for_non_power_of_two() {
        assert_eq!(padding_for(0, 12), 0);
        assert_eq!(padding_for(5, 12), 7);
        assert_eq!(padding_for(12, 12), 0);
        assert_eq!(padding_for(13, 12), 11);
    }

    #[test]
    fn test_byte_len() {
        assert_eq!(byte_len(&[0u32; 5]), 20);
        assert_eq!(byte_len::<u64>(&[]), 0);
    }
}
