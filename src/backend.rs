//! Residency, device selection masks and memory hints.
//!
//! # Residency
//!
//! Every [`Buffer`](crate::buffer::Buffer) lives either on the host or on the
//! accelerator. The residency of a buffer is the domain holding its one valid
//! copy; see [`Residency`].
//!
//! # Device Types
//!
//! Sessions pick devices through a [`DeviceTypes`] bitmask, so a caller can
//! ask for "any GPU" or "discrete GPUs or CPU rasterizers" in one value:
//!
//! ```
//! use weft_nn::backend::DeviceTypes;
//! let mask = DeviceTypes::DISCRETE_GPU | DeviceTypes::CPU;
//! assert!(mask.contains(DeviceTypes::CPU));
//! ```

use core::ops::{BitOr, BitOrAssign};

/// Memory domain holding a buffer's valid contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Residency {
    /// Host memory (default).
    #[default]
    Host = 0,
    /// Accelerator memory.
    Device = 1,
}

/// Bitmask of accelerator device categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceTypes(u32);

impl DeviceTypes {
    /// Matches nothing.
    pub const NONE: Self = Self(0);
    /// Devices the driver does not categorise.
    pub const OTHER: Self = Self(1 << 0);
    /// GPUs sharing memory with the host.
    pub const INTEGRATED_GPU: Self = Self(1 << 1);
    /// GPUs with dedicated memory.
    pub const DISCRETE_GPU: Self = Self(1 << 2);
    /// Virtualised GPUs.
    pub const VIRTUAL_GPU: Self = Self(1 << 3);
    /// Software rasterizers running on the CPU.
    pub const CPU: Self = Self(1 << 4);
    /// Any kind of GPU.
    pub const GPU: Self = Self(Self::INTEGRATED_GPU.0 | Self::DISCRETE_GPU.0 | Self::VIRTUAL_GPU.0);
    /// Every device.
    pub const ALL: Self = Self(0x1f);

    /// Raw bits of the mask.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns `true` if every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    /// Returns `true` if the mask selects this wgpu device category.
    #[must_use]
    pub fn matches(self, device_type: wgpu::DeviceType) -> bool {
        self.contains(Self::from(device_type))
    }
}

impl Default for DeviceTypes {
    fn default() -> Self {
        Self::ALL
    }
}

impl BitOr for DeviceTypes {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for DeviceTypes {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl From<wgpu::DeviceType> for DeviceTypes {
    fn from(value: wgpu::DeviceType) -> Self {
        match value {
            wgpu::DeviceType::Other => Self::OTHER,
            wgpu::DeviceType::IntegratedGpu => Self::INTEGRATED_GPU,
            wgpu::DeviceType::DiscreteGpu => Self::DISCRETE_GPU,
            wgpu::DeviceType::VirtualGpu => Self::VIRTUAL_GPU,
            wgpu::DeviceType::Cpu => Self::CPU,
        }
    }
}

/// How a buffer's device allocation is created and may be bound.
///
/// Fixed when the buffer is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryHint {
    /// Kernels may only read it. Initialised from host contents.
    ReadOnly,
    /// Allocated empty, then uploaded through the queue.
    ReadWrite,
    /// Initialised directly from host contents at allocation.
    #[default]
    HostBacked,
}

/// Access a kernel needs on a bound buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Read only.
    Read,
    /// Read and write.
    Write,
}
