//! Memory type and queue family selection
//!
//! Both searches are pure functions over the data a backend reports, so
//! they are shared by the Vulkan and dummy devices and tested directly.

use ash::vk;

use crate::dd_emit;

/// First memory type allowed by `type_bits` whose property flags contain `flags`.
///
/// Emits DD001 and returns `None` if no type matches.
pub fn find_memory_type_index(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    let found = (0..props.memory_type_count).find(|&i| {
        type_bits & (1 << i) != 0 && props.memory_types[i as usize].property_flags.contains(flags)
    });

    if found.is_none() {
        dd_emit!(DD001, "type bits {:#x}, flags {:?}", type_bits, flags);
    }
    found
}

/// Lowest queue family index usable on every device of a group.
///
/// `per_device_flags[d][q]` holds the capabilities of family `q` on device
/// `d`. A family qualifies when on every device it has all `required` bits,
/// none of the `excluded` bits, and is not listed in `taken`.
pub fn select_queue_family(
    per_device_flags: &[Vec<vk::QueueFlags>],
    required: vk::QueueFlags,
    excluded: vk::QueueFlags,
    taken: &[u32],
) -> Option<u32> {
    let family_count = per_device_flags.iter().map(Vec::len).min()?;

    (0..family_count as u32).find(|&q| {
        !taken.contains(&q)
            && per_device_flags.iter().all(|families| {
                let flags = families[q as usize];
                flags.contains(required) && !flags.intersects(excluded)
            })
    })
}

/// Pick graphics, transfer and framebuffer-transfer families for a group.
///
/// Transfer prefers a family without graphics, and framebuffer transfer a
/// family distinct from both; each falls back to sharing when the group
/// exposes too few families.
pub fn select_queue_families(per_device_flags: &[Vec<vk::QueueFlags>]) -> Option<super::QueueFamilies> {
    let none = vk::QueueFlags::empty();

    let graphics = select_queue_family(per_device_flags, vk::QueueFlags::GRAPHICS, none, &[])?;
    let transfer = select_queue_family(per_device_flags, vk::QueueFlags::TRANSFER, vk::QueueFlags::GRAPHICS, &[])
        .or_else(|| select_queue_family(per_device_flags, vk::QueueFlags::TRANSFER, none, &[graphics]))
        .unwrap_or(graphics);
    let framebuffer_transfer =
        select_queue_family(per_device_flags, vk::QueueFlags::TRANSFER, none, &[graphics, transfer]).unwrap_or(transfer);

    Some(super::QueueFamilies {
        graphics,
        transfer,
        framebuffer_transfer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = flags.len() as u32;
        for (i, f) in flags.iter().enumerate() {
            props.memory_types[i].property_flags = *f;
        }
        props
    }

    #[test]
    fn test_find_memory_type_index() {
        let p = props(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);

        assert_eq!(find_memory_type_index(&p, 0b11, vk::MemoryPropertyFlags::DEVICE_LOCAL), Some(0));
        assert_eq!(find_memory_type_index(&p, 0b11, vk::MemoryPropertyFlags::HOST_VISIBLE), Some(1));
        assert_eq!(find_memory_type_index(&p, 0b01, vk::MemoryPropertyFlags::HOST_VISIBLE), None);
        assert_eq!(find_memory_type_index(&p, 0b11, vk::MemoryPropertyFlags::LAZILY_ALLOCATED), None);
    }

    #[test]
    fn test_select_queue_family_requires_all_devices() {
        let g = vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER;
        let t = vk::QueueFlags::TRANSFER;
        let devices = vec![vec![g, t, t], vec![g, g, t]];

        assert_eq!(select_queue_family(&devices, vk::QueueFlags::GRAPHICS, vk::QueueFlags::empty(), &[]), Some(0));
        assert_eq!(select_queue_family(&devices, t, vk::QueueFlags::GRAPHICS, &[]), Some(2));
        assert_eq!(select_queue_family(&[], t, vk::QueueFlags::empty(), &[]), None);
    }

    #[test]
    fn test_select_queue_families_distinct_and_fallback() {
        let g = vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER;
        let t = vk::QueueFlags::TRANSFER;

        let rich = select_queue_families(&[vec![g, t, t]]).unwrap();
        assert_eq!((rich.graphics, rich.transfer, rich.framebuffer_transfer), (0, 1, 2));

        let poor = select_queue_families(&[vec![g]]).unwrap();
        assert_eq!((poor.graphics, poor.transfer, poor.framebuffer_transfer), (0, 0, 0));

        assert!(select_queue_families(&[vec![t]]).is_none());
    }
}
