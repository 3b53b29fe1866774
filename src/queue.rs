//! Queue family resolution and queue retrieval.
use crate::BootstrapSmallVec;
use ash::vk;
use std::{
    hash::{Hash, Hasher},
    os::raw::c_float,
};

/// Setup for [`vk::Queue`] creation.
/// The [`Hash`] and [`PartialEq`] implementations on this struct **only**
/// compare `queue_family_index`.
#[derive(Debug, Clone)]
pub struct QueueSetup {
    /// Flags used to specify usage behavior of the queue.
    pub flags: vk::DeviceQueueCreateFlags,
    /// Index of the queue family in the queue family array.
    pub queue_family_index: u32,
    /// Specifies the amount of queues and the respective priority for each.
    pub queue_priorities: Vec<c_float>,
}

impl QueueSetup {
    /// Create a new queue setup with simplified arguments.
    /// Queue priorities will all be 1.0 and all flags will be empty.
    #[inline]
    pub fn simple(queue_family_index: u32, queue_count: usize) -> QueueSetup {
        QueueSetup {
            flags: vk::DeviceQueueCreateFlags::empty(),
            queue_family_index,
            queue_priorities: (0..queue_count).map(|_| 1.0).collect(),
        }
    }

    #[inline]
    pub(crate) fn as_vulkan(&self) -> vk::DeviceQueueCreateInfoBuilder {
        vk::DeviceQueueCreateInfo::builder()
            .flags(self.flags)
            .queue_family_index(self.queue_family_index)
            .queue_priorities(&self.queue_priorities)
    }
}

impl PartialEq for QueueSetup {
    fn eq(&self, rhs: &Self) -> bool {
        self.queue_family_index == rhs.queue_family_index
    }
}

impl Eq for QueueSetup {}

impl Hash for QueueSetup {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.queue_family_index.hash(state);
    }
}

/// Queue families chosen for the graphics and presentation roles.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedQueueFamilies {
    /// Family used for graphics commands.
    pub graphics: u32,
    /// Family used for presentation.
    pub present: u32,
}

impl ResolvedQueueFamilies {
    /// Returns true if both roles share a single family.
    #[inline]
    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }

    /// The distinct families, graphics first.
    pub fn unique_families(&self) -> BootstrapSmallVec<u32> {
        let mut families = BootstrapSmallVec::new();
        families.push(self.graphics);
        if !self.is_shared() {
            families.push(self.present);
        }

        families
    }

    /// One queue creation request per distinct family, each for a single
    /// queue with priority 1.0.
    pub fn queue_setups(&self) -> BootstrapSmallVec<QueueSetup> {
        self.unique_families()
            .into_iter()
            .map(|family| QueueSetup::simple(family, 1))
            .collect()
    }

    /// Sharing mode and queue family indices for resources used by both
    /// roles, such as swapchain images.
    pub fn sharing(&self) -> (vk::SharingMode, BootstrapSmallVec<u32>) {
        let families = self.unique_families();
        if families.len() > 1 {
            (vk::SharingMode::CONCURRENT, families)
        } else {
            (vk::SharingMode::EXCLUSIVE, BootstrapSmallVec::new())
        }
    }

    /// Fetches queue 0 of every distinct family through `get_queue`, which
    /// receives the family index and the queue index. The graphics and
    /// present handles alias when the families coincide.
    pub fn fetch_queues(&self, mut get_queue: impl FnMut(u32, u32) -> vk::Queue) -> Queues {
        let graphics = get_queue(self.graphics, 0);
        let present = if self.is_shared() {
            graphics
        } else {
            get_queue(self.present, 0)
        };

        Queues { graphics, present }
    }
}

/// Queue handles for the graphics and presentation roles.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Queues {
    /// Queue for graphics commands.
    pub graphics: vk::Queue,
    /// Queue for presentation. May be the same object as `graphics`.
    pub present: vk::Queue,
}
