//! The accelerator session.
//!
//! A [`Session`] owns everything the device side needs: the selected wgpu
//! device and its single queue, the compiled-program cache and the live
//! allocation counter. It is created once, explicitly, and cloned into every
//! layer; clones share the same state.
//!
//! When no adapter matches the requested [`DeviceTypes`](crate::backend::DeviceTypes)
//! the session is *disabled*. That is not an error: every fusable layer then
//! stays in host mode and `enable_device(true)` simply returns `false`.
//!
//! ```no_run
//! use weft_nn::session::{Session, SessionConfig};
//! use weft_nn::backend::DeviceTypes;
//!
//! let session = Session::initialize(SessionConfig::new().device_types(DeviceTypes::GPU))?;
//! if !session.enabled() {
//!     println!("running on the host only");
//! }
//! # Ok::<(), weft_nn::Error>(())
//! ```

mod dispatch;
mod program;
mod sources;

pub use dispatch::Dims;
pub use program::{Kernel, Program};
pub use sources::{kernel_source, register_kernel_source, require_entry_points};

use crate::backend::DeviceTypes;
use crate::error::{Error, Result};
use crate::real;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Device selection for [`Session::initialize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Device categories that may be selected.
    pub device_types: DeviceTypes,
    /// Index of the platform (wgpu backend) in order of discovery.
    pub platform_index: usize,
    /// Index of the device among the matching ones on that platform.
    pub device_index: usize,
    /// Debug label given to the wgpu device.
    pub label: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device_types: DeviceTypes::ALL,
            platform_index: 0,
            device_index: 0,
            label: "weft".to_string(),
        }
    }
}

impl SessionConfig {
    /// Default configuration: any device on the first platform.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts selection to these device categories.
    #[must_use]
    pub fn device_types(mut self, device_types: DeviceTypes) -> Self {
        self.device_types = device_types;
        self
    }

    /// Selects the platform by discovery index.
    #[must_use]
    pub fn platform_index(mut self, platform_index: usize) -> Self {
        self.platform_index = platform_index;
        self
    }

    /// Selects the device among those matching on the platform.
    #[must_use]
    pub fn device_index(mut self, device_index: usize) -> Self {
        self.device_index = device_index;
        self
    }

    /// Sets the wgpu debug label.
    #[must_use]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// The selected device and its command queue.
///
/// Device buffers keep an `Arc` to this so they can read themselves back and
/// free their memory without going through the session.
pub struct GpuContext {
    /// The wgpu device.
    pub device: wgpu::Device,
    /// The single command queue all work is submitted to.
    pub queue: wgpu::Queue,
    /// Adapter description, as reported by the driver.
    pub info: wgpu::AdapterInfo,
    live_buffers: AtomicUsize,
}

impl GpuContext {
    pub(crate) fn track_allocation(&self) {
        self.live_buffers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn track_release(&self) {
        self.live_buffers.fetch_sub(1, Ordering::Relaxed);
    }

    /// Number of device allocations currently alive on this context.
    pub fn live_buffers(&self) -> usize {
        self.live_buffers.load(Ordering::Relaxed)
    }

    /// Runs `f` inside a validation error scope.
    ///
    /// A captured validation error becomes [`Error::Accelerator`] instead of
    /// reaching the uncaptured-error handler.
    pub(crate) fn validated<T>(&self, what: &str, f: impl FnOnce(&wgpu::Device) -> T) -> Result<T> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f(&self.device);
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(error) => {
                tracing::error!(what, %error, "device validation failed");
                Err(Error::Accelerator(format!("{what}: {error}")))
            }
            None => Ok(value),
        }
    }

    /// Largest storage binding, in bytes, the device accepts.
    pub(crate) fn max_storage_bytes(&self) -> u64 {
        let limits = self.device.limits();
        u64::from(limits.max_storage_buffer_binding_size).min(limits.max_buffer_size)
    }
}

impl core::fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GpuContext")
            .field("adapter", &self.info.name)
            .field("backend", &self.info.backend)
            .field("live_buffers", &self.live_buffers())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ProgramKey {
    identity: String,
    digest: u64,
    entry_points: Vec<String>,
}

struct Inner {
    config: SessionConfig,
    platform: Option<wgpu::Backend>,
    devices: Vec<wgpu::AdapterInfo>,
    gpu: Option<Arc<GpuContext>>,
    programs: Mutex<HashMap<ProgramKey, Arc<Program>>>,
}

/// Shared handle to the accelerator state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl core::fmt::Debug for Session {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Session")
            .field("enabled", &self.enabled())
            .field("platform", &self.inner.platform)
            .field("devices", &self.inner.devices.len())
            .field("gpu", &self.inner.gpu)
            .finish()
    }
}

impl Session {
    /// Discovers devices and opens the configured one.
    ///
    /// Adapters are grouped into platforms by wgpu backend, in the order the
    /// instance reports them. The platform at `platform_index` is filtered by
    /// the device-type mask and the device at `device_index` is opened.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Accelerator`] if a matching adapter refuses to hand
    /// out a device. Finding no matching adapter is not an error; the
    /// returned session is disabled.
    pub fn initialize(config: SessionConfig) -> Result<Self> {
        let instance = wgpu::Instance::default();
        let adapters = instance.enumerate_adapters(wgpu::Backends::all());

        let mut platforms: Vec<wgpu::Backend> = Vec::new();
        for adapter in &adapters {
            let backend = adapter.get_info().backend;
            if !platforms.contains(&backend) {
                platforms.push(backend);
            }
        }

        let Some(&platform) = platforms.get(config.platform_index) else {
            tracing::warn!(
                platform_index = config.platform_index,
                platforms = platforms.len(),
                "no such platform; accelerator disabled"
            );
            return Ok(Self::from_parts(config, None, Vec::new(), None));
        };

        let matching: Vec<wgpu::Adapter> = adapters
            .into_iter()
            .filter(|adapter| {
                let info = adapter.get_info();
                info.backend == platform && config.device_types.matches(info.device_type)
            })
            .collect();
        let devices: Vec<wgpu::AdapterInfo> = matching.iter().map(wgpu::Adapter::get_info).collect();

        for (id, info) in devices.iter().enumerate() {
            tracing::info!(
                id,
                name = %info.name,
                device_type = ?info.device_type,
                backend = ?info.backend,
                driver = %info.driver,
                "compute device"
            );
        }

        let Some(adapter) = matching.get(config.device_index) else {
            tracing::warn!(
                device_types = config.device_types.bits(),
                device_index = config.device_index,
                matching = devices.len(),
                "no matching device; accelerator disabled"
            );
            return Ok(Self::from_parts(config, Some(platform), devices, None));
        };

        let mut required_features = wgpu::Features::empty();
        if real::is_double() {
            if !adapter.features().contains(wgpu::Features::SHADER_F64) {
                tracing::warn!(
                    adapter = %adapter.get_info().name,
                    "device lacks 64-bit float support; accelerator disabled"
                );
                return Ok(Self::from_parts(config, Some(platform), devices, None));
            }
            required_features |= wgpu::Features::SHADER_F64;
        }

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some(config.label.as_str()),
            required_features,
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))
        .map_err(|e| Error::Accelerator(e.to_string()))?;

        let gpu = GpuContext {
            device,
            queue,
            info: adapter.get_info(),
            live_buffers: AtomicUsize::new(0),
        };
        tracing::info!(adapter = %gpu.info.name, "device initialized");

        Ok(Self::from_parts(config, Some(platform), devices, Some(Arc::new(gpu))))
    }

    /// A session with no accelerator; everything runs on the host.
    #[must_use]
    pub fn disabled() -> Self {
        Self::from_parts(SessionConfig::default(), None, Vec::new(), None)
    }

    fn from_parts(
        config: SessionConfig,
        platform: Option<wgpu::Backend>,
        devices: Vec<wgpu::AdapterInfo>,
        gpu: Option<Arc<GpuContext>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                platform,
                devices,
                gpu,
                programs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Whether a device is open and kernels can be dispatched.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.inner.gpu.is_some()
    }

    /// The configuration this session was created with.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// The selected platform, if one exists.
    #[must_use]
    pub fn platform(&self) -> Option<wgpu::Backend> {
        self.inner.platform
    }

    /// Every device on the platform that matched the mask.
    #[must_use]
    pub fn devices(&self) -> &[wgpu::AdapterInfo] {
        &self.inner.devices
    }

    /// The open device, if the session is enabled.
    #[must_use]
    pub fn gpu(&self) -> Option<&Arc<GpuContext>> {
        self.inner.gpu.as_ref()
    }

    pub(crate) fn require_gpu(&self) -> Result<&Arc<GpuContext>> {
        self.gpu()
            .ok_or_else(|| Error::Precondition("accelerator session is disabled".to_string()))
    }

    /// Number of live device allocations; zero when disabled.
    #[must_use]
    pub fn live_device_buffers(&self) -> usize {
        self.gpu().map_or(0, |gpu| gpu.live_buffers())
    }

    /// Number of distinct programs compiled so far.
    #[must_use]
    pub fn cached_programs(&self) -> usize {
        self.inner
            .programs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}
