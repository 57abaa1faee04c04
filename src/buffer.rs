//! Host/device buffers of [`Real`] values.
//!
//! A [`Buffer`] holds exactly one valid copy of its contents, either in host
//! memory or in a device allocation, and moves between the two with
//! [`Buffer::migrate`]. Element access only works while host-resident and
//! kernel binding only while device-resident; nothing converts implicitly.
//!
//! Migration without `flush` keeps the allocation being left behind. A later
//! migration back then overwrites it in place instead of allocating again,
//! which is what scratch buffers reused across calls want. The copy left
//! behind is *stale* and never read.
//!
//! [`Buffer::scoped`] returns a [`Restore`] guard that migrates back to the
//! previous residency when it goes out of scope, on every exit path.
//!
//! # Example
//!
//! ```
//! use weft_nn::buffer::Buffer;
//! use weft_nn::backend::Residency;
//! use weft_nn::session::Session;
//!
//! let session = Session::disabled();
//! let mut buffer = Buffer::from_vec(vec![1.0, 2.0, 3.0]);
//! buffer.set(1, 5.0)?;
//! assert_eq!(buffer.to_vec()?, [1.0, 5.0, 3.0]);
//!
//! // migrating to where it already lives is a no-op
//! assert_eq!(buffer.migrate(&session, Residency::Host, true)?, Residency::Host);
//! # Ok::<(), weft_nn::Error>(())
//! ```

use crate::backend::{Access, MemoryHint, Residency};
use crate::error::{Error, Result};
use crate::real::{REAL_BYTES, Real};
use crate::session::{GpuContext, Session};
use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use wgpu::util::DeviceExt;

fn byte_len(len: usize) -> u64 {
    // never zero; wgpu cannot bind an empty storage buffer
    (len.max(1) * REAL_BYTES) as u64
}

/// One device allocation plus the context that owns it.
struct DeviceArray {
    gpu: Arc<GpuContext>,
    raw: wgpu::Buffer,
    len: usize,
    origin: Backtrace,
}

impl DeviceArray {
    fn create(gpu: &Arc<GpuContext>, values: &[Real], hint: MemoryHint) -> Result<Self> {
        let usage = wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_SRC
            | wgpu::BufferUsages::COPY_DST;

        let size = byte_len(values.len());
        let max = gpu.max_storage_bytes();
        if size > max {
            return Err(Error::Accelerator(format!(
                "{size}-byte buffer exceeds the device storage binding limit of {max} bytes"
            )));
        }

        let raw = gpu.validated("buffer allocation", |device| match hint {
            MemoryHint::HostBacked | MemoryHint::ReadOnly if !values.is_empty() => {
                device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("weft_buffer"),
                    contents: bytemuck::cast_slice(values),
                    usage,
                })
            }
            _ => device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("weft_buffer"),
                size,
                usage,
                mapped_at_creation: false,
            }),
        })?;
        gpu.track_allocation();

        let array = Self {
            gpu: Arc::clone(gpu),
            raw,
            len: values.len(),
            origin: Backtrace::capture(),
        };
        if hint == MemoryHint::ReadWrite {
            array.upload(values)?;
        }
        Ok(array)
    }

    fn upload(&self, values: &[Real]) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        self.gpu.validated("buffer upload", |_| {
            self.gpu
                .queue
                .write_buffer(&self.raw, 0, bytemuck::cast_slice(values));
            self.gpu.queue.submit(None);
        })?;
        self.gpu.device.poll(wgpu::PollType::Wait)?;
        Ok(())
    }

    fn read(&self) -> Result<Vec<Real>> {
        if self.len == 0 {
            return Ok(Vec::new());
        }

        let device = &self.gpu.device;
        let size = byte_len(self.len);
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("weft_staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("weft_readback"),
        });
        encoder.copy_buffer_to_buffer(&self.raw, 0, &staging, 0, size);
        self.gpu.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        device.poll(wgpu::PollType::Wait)?;
        rx.recv()
            .map_err(|_| Error::Accelerator("read-back callback never ran".to_string()))??;

        let view = slice.get_mapped_range();
        let data = bytemuck::cast_slice::<u8, Real>(&view).to_vec();
        drop(view);
        staging.unmap();
        Ok(data)
    }
}

impl Drop for DeviceArray {
    fn drop(&mut self) {
        self.raw.destroy();
        self.gpu.track_release();
    }
}

/// A contiguous array of [`Real`] living on the host or on the device.
pub struct Buffer {
    len: usize,
    residency: Residency,
    hint: MemoryHint,
    host: Option<Vec<Real>>,
    device: Option<DeviceArray>,
    released: bool,
}

impl core::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len)
            .field("residency", &self.residency)
            .field("hint", &self.hint)
            .field("host", &self.host.is_some())
            .field("device", &self.device.is_some())
            .field("released", &self.released)
            .finish()
    }
}

impl Buffer {
    /// A host-resident buffer of `len` zeros.
    #[must_use]
    pub fn zeros(len: usize) -> Self {
        Self::from_vec(vec![0.0; len])
    }

    /// A host-resident buffer owning `values`.
    #[must_use]
    pub fn from_vec(values: Vec<Real>) -> Self {
        Self {
            len: values.len(),
            residency: Residency::Host,
            hint: MemoryHint::default(),
            host: Some(values),
            device: None,
            released: false,
        }
    }

    /// Sets the memory hint used for device allocations.
    #[must_use]
    pub fn with_hint(mut self, hint: MemoryHint) -> Self {
        self.hint = hint;
        self
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the buffer holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Where the valid copy currently lives.
    #[must_use]
    pub fn residency(&self) -> Residency {
        self.residency
    }

    /// The memory hint fixed at creation.
    #[must_use]
    pub fn hint(&self) -> MemoryHint {
        self.hint
    }

    /// Returns `true` once [`release`](Self::release) has run.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Returns `true` if a device allocation exists, stale or not.
    #[must_use]
    pub fn has_device_allocation(&self) -> bool {
        self.device.is_some()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.released {
            Err(Error::Disposed)
        } else {
            Ok(())
        }
    }

    /// Moves the valid contents to `target`, returning the previous residency.
    ///
    /// With `flush` the allocation left behind is freed; without it the
    /// allocation is kept and reused by the next migration back.
    ///
    /// # Errors
    ///
    /// [`Error::Disposed`] after release, [`Error::Precondition`] when moving
    /// to the device through a disabled session, and any device error raised
    /// during upload or read-back.
    pub fn migrate(&mut self, session: &Session, target: Residency, flush: bool) -> Result<Residency> {
        self.ensure_live()?;
        let previous = self.residency;
        if previous == target {
            return Ok(previous);
        }

        match target {
            Residency::Host => {
                let device = self
                    .device
                    .as_ref()
                    .ok_or_else(|| Error::Precondition("device copy missing".to_string()))?;
                let data = device.read()?;
                if let Some(host) = self.host.as_mut().filter(|h| h.len() == data.len()) {
                    host.copy_from_slice(&data);
                } else {
                    self.host = Some(data);
                }
                if flush {
                    self.device = None;
                }
            }
            Residency::Device => {
                let gpu = session.require_gpu()?;
                let host = self
                    .host
                    .as_deref()
                    .ok_or_else(|| Error::Precondition("host copy missing".to_string()))?;
                let reusable = self
                    .device
                    .as_ref()
                    .is_some_and(|d| d.len == host.len() && Arc::ptr_eq(&d.gpu, gpu));
                if reusable {
                    if let Some(device) = &self.device {
                        device.upload(host)?;
                    }
                } else {
                    self.device = Some(DeviceArray::create(gpu, host, self.hint)?);
                }
                if flush {
                    self.host = None;
                }
            }
        }

        self.residency = target;
        tracing::trace!(len = self.len, from = ?previous, to = ?target, flush, "buffer migrated");
        Ok(previous)
    }

    /// Migrates to `target` (flushing) until the guard is dropped.
    ///
    /// # Errors
    ///
    /// Same as [`migrate`](Self::migrate).
    pub fn scoped<'a>(&'a mut self, session: &Session, target: Residency) -> Result<Restore<'a>> {
        self.scoped_with(session, target, true)
    }

    /// Like [`scoped`](Self::scoped) with an explicit flush flag, used for
    /// both the migration and the restore.
    ///
    /// # Errors
    ///
    /// Same as [`migrate`](Self::migrate).
    pub fn scoped_with<'a>(
        &'a mut self,
        session: &Session,
        target: Residency,
        flush: bool,
    ) -> Result<Restore<'a>> {
        let restore_to = self.migrate(session, target, flush)?;
        Ok(Restore {
            buffer: self,
            session: session.clone(),
            restore_to,
            flush,
            armed: true,
        })
    }

    /// Host contents.
    ///
    /// # Errors
    ///
    /// [`Error::Unsupported`] unless host-resident.
    pub fn host(&self) -> Result<&[Real]> {
        self.ensure_live()?;
        if self.residency != Residency::Host {
            return Err(Error::Unsupported {
                op: "host read",
                residency: self.residency,
            });
        }
        self.host
            .as_deref()
            .ok_or_else(|| Error::Precondition("host copy missing".to_string()))
    }

    /// Mutable host contents.
    ///
    /// # Errors
    ///
    /// [`Error::Unsupported`] unless host-resident.
    pub fn host_mut(&mut self) -> Result<&mut [Real]> {
        self.ensure_live()?;
        if self.residency != Residency::Host {
            return Err(Error::Unsupported {
                op: "host write",
                residency: self.residency,
            });
        }
        self.host
            .as_deref_mut()
            .ok_or_else(|| Error::Precondition("host copy missing".to_string()))
    }

    /// Reads element `index`.
    ///
    /// # Errors
    ///
    /// [`Error::Unsupported`] unless host-resident; [`Error::Precondition`]
    /// if `index` is out of range.
    pub fn get(&self, index: usize) -> Result<Real> {
        let len = self.len;
        self.host()?
            .get(index)
            .copied()
            .ok_or_else(|| Error::Precondition(format!("index {index} out of range for {len}")))
    }

    /// Writes element `index`.
    ///
    /// # Errors
    ///
    /// Same as [`get`](Self::get).
    pub fn set(&mut self, index: usize, value: Real) -> Result<()> {
        let len = self.len;
        let slot = self
            .host_mut()?
            .get_mut(index)
            .ok_or_else(|| Error::Precondition(format!("index {index} out of range for {len}")))?;
        *slot = value;
        Ok(())
    }

    /// The device allocation, for binding to a kernel.
    ///
    /// # Errors
    ///
    /// [`Error::Unsupported`] unless device-resident, or when asking for
    /// write access to a [`MemoryHint::ReadOnly`] buffer.
    pub fn device(&self, access: Access) -> Result<&wgpu::Buffer> {
        self.ensure_live()?;
        if self.residency != Residency::Device {
            return Err(Error::Unsupported {
                op: "kernel binding",
                residency: self.residency,
            });
        }
        if access == Access::Write && self.hint == MemoryHint::ReadOnly {
            return Err(Error::Unsupported {
                op: "writable binding of a read-only buffer",
                residency: self.residency,
            });
        }
        self.device
            .as_ref()
            .map(|device| &device.raw)
            .ok_or_else(|| Error::Precondition("device copy missing".to_string()))
    }

    /// Copies the contents out, reading back from the device if needed.
    ///
    /// # Errors
    ///
    /// [`Error::Disposed`] after release, or a device error during read-back.
    pub fn to_vec(&self) -> Result<Vec<Real>> {
        Ok(self.as_host_vec()?.into_owned())
    }

    /// Host view of the contents, borrowed when host-resident.
    ///
    /// # Errors
    ///
    /// Same as [`to_vec`](Self::to_vec).
    pub fn as_host_vec(&self) -> Result<Cow<'_, [Real]>> {
        self.ensure_live()?;
        match self.residency {
            Residency::Host => self.host().map(Cow::Borrowed),
            Residency::Device => self
                .device
                .as_ref()
                .ok_or_else(|| Error::Precondition("device copy missing".to_string()))?
                .read()
                .map(Cow::Owned),
        }
    }

    /// Overwrites every element wherever the buffer lives.
    ///
    /// # Errors
    ///
    /// [`Error::LengthMismatch`] if `values` has the wrong length.
    pub fn write(&mut self, values: &[Real]) -> Result<()> {
        self.ensure_live()?;
        if values.len() != self.len {
            return Err(Error::LengthMismatch {
                expected: self.len,
                got: values.len(),
            });
        }
        match self.residency {
            Residency::Host => {
                self.host_mut()?.copy_from_slice(values);
                Ok(())
            }
            Residency::Device => self
                .device
                .as_ref()
                .ok_or_else(|| Error::Precondition("device copy missing".to_string()))?
                .upload(values),
        }
    }

    /// Sets every element to zero wherever the buffer lives.
    ///
    /// # Errors
    ///
    /// Same as [`write`](Self::write).
    pub fn fill_zero(&mut self) -> Result<()> {
        match self.residency {
            Residency::Host => {
                self.host_mut()?.fill(0.0);
                Ok(())
            }
            Residency::Device => self.write(&vec![0.0; self.len]),
        }
    }

    /// Frees both copies. Idempotent; later use fails with [`Error::Disposed`].
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.host = None;
        self.device = None;
        self.released = true;
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if self.released || self.residency != Residency::Device {
            return;
        }
        if let Some(device) = &self.device {
            tracing::warn!(
                len = self.len,
                "device buffer dropped without release\n===STACKTRACE===\n{}",
                device.origin
            );
        }
    }
}

/// Guard returned by [`Buffer::scoped`]; migrates back when dropped.
///
/// Dereferences to the buffer. Errors during the restoring migration are
/// logged; call [`finish`](Self::finish) to observe them instead.
pub struct Restore<'a> {
    buffer: &'a mut Buffer,
    session: Session,
    restore_to: Residency,
    flush: bool,
    armed: bool,
}

impl Restore<'_> {
    /// The residency the buffer returns to.
    #[must_use]
    pub fn restores_to(&self) -> Residency {
        self.restore_to
    }

    /// Restores now, reporting failure.
    ///
    /// # Errors
    ///
    /// Any error raised by the restoring migration.
    pub fn finish(mut self) -> Result<()> {
        self.armed = false;
        if self.buffer.released {
            return Ok(());
        }
        self.buffer
            .migrate(&self.session, self.restore_to, self.flush)
            .map(|_| ())
    }
}

impl Deref for Restore<'_> {
    type Target = Buffer;

    fn deref(&self) -> &Buffer {
        self.buffer
    }
}

impl DerefMut for Restore<'_> {
    fn deref_mut(&mut self) -> &mut Buffer {
        self.buffer
    }
}

impl Drop for Restore<'_> {
    fn drop(&mut self) {
        if !self.armed || self.buffer.released {
            return;
        }
        if let Err(e) = self
            .buffer
            .migrate(&self.session, self.restore_to, self.flush)
        {
            tracing::error!(error = %e, to = ?self.restore_to, "failed to restore buffer residency");
        }
    }
}
