//! Size helper functions.

use ash::vk;

/// Convert kibibytes to bytes.
#[inline]
pub const fn kb(n: vk::DeviceSize) -> vk::DeviceSize {
    n * 1024
}

/// Convert mebibytes to bytes.
#[inline]
pub const fn mb(n: vk::DeviceSize) -> vk::DeviceSize {
    n * 1024 * 1024
}

/// Convert gibibytes to bytes.
#[inline]
pub const fn gb(n: vk::DeviceSize) -> vk::DeviceSize {
    n * 1024 * 1024 * 1024
}

/// Format bytes as a human-readable string.
pub fn format_bytes(bytes: vk::DeviceSize) -> String {
    const KB: vk::DeviceSize = 1024;
    const MB: vk::DeviceSize = KB * 1024;
    const GB: vk::DeviceSize = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_conversions() {
        assert_eq!(kb(600), 614_400);
        assert_eq!(mb(4), 4 * 1024 * 1024);
        assert_eq!(gb(1), 1 << 30);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(kb(600)), "600.00 KB");
        assert_eq!(format_bytes(mb(4)), "4.00 MB");
        assert_eq!(format_bytes(gb(2)), "2.00 GB");
    }
}
