//! Kernel launches.

use super::{Kernel, Session};
use crate::error::{Error, Result};
use wgpu::util::DeviceExt;

/// Edge of the square workgroup every kernel declares.
pub(crate) const WORKGROUP: u32 = 8;

/// Uniform block bound at binding 0 of every dispatch.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Dims {
    /// Samples in the batch.
    pub batch: u32,
    /// Outputs per sample.
    pub out_count: u32,
    /// Inputs per sample.
    pub in_count: u32,
    /// Keeps the block 16 bytes.
    pub pad: u32,
}

impl Dims {
    /// Builds the block from host sizes.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if a size does not fit in `u32`.
    pub fn new(batch: usize, out_count: usize, in_count: usize) -> Result<Self> {
        Ok(Self {
            batch: dim(batch)?,
            out_count: dim(out_count)?,
            in_count: dim(in_count)?,
            pad: 0,
        })
    }
}

pub(crate) fn dim(n: usize) -> Result<u32> {
    u32::try_from(n).map_err(|_| Error::Config(format!("dimension {n} exceeds u32")))
}

impl Session {
    /// Runs `kernel` over a two-dimensional global range and waits for it.
    ///
    /// `bindings` pairs a binding slot with an already device-resident
    /// buffer; slot 0 is reserved for `dims`. `global` is rounded up to whole
    /// workgroups and kernels bounds-check their own indices.
    ///
    /// # Errors
    ///
    /// [`Error::Precondition`] on a disabled session, [`Error::Accelerator`]
    /// if the device rejects the bindings or the launch size, [`Error::Poll`]
    /// if the device fails while waiting.
    pub fn dispatch(
        &self,
        kernel: &Kernel,
        bindings: &[(u32, &wgpu::Buffer)],
        dims: Dims,
        global: [usize; 2],
    ) -> Result<()> {
        let gpu = self.require_gpu()?;
        let [gx, gy] = [dim(global[0])?, dim(global[1])?];
        if gx == 0 || gy == 0 {
            return Ok(());
        }

        let limit = gpu.device.limits().max_compute_workgroups_per_dimension;
        let groups = [gx.div_ceil(WORKGROUP), gy.div_ceil(WORKGROUP)];
        if groups.iter().any(|&g| g > limit) {
            return Err(Error::Accelerator(format!(
                "{}: {groups:?} workgroups exceed the per-dimension limit of {limit}",
                kernel.name()
            )));
        }

        gpu.validated(kernel.name(), |device| {
            let dims_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("dims"),
                contents: bytemuck::bytes_of(&dims),
                usage: wgpu::BufferUsages::UNIFORM,
            });

            let mut entries = Vec::with_capacity(bindings.len() + 1);
            entries.push(wgpu::BindGroupEntry {
                binding: 0,
                resource: dims_buffer.as_entire_binding(),
            });
            entries.extend(bindings.iter().map(|(binding, buffer)| wgpu::BindGroupEntry {
                binding: *binding,
                resource: buffer.as_entire_binding(),
            }));

            let layout = kernel.pipeline().get_bind_group_layout(0);
            let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(kernel.name()),
                layout: &layout,
                entries: &entries,
            });

            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(kernel.name()),
            });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some(kernel.name()),
                    timestamp_writes: None,
                });
                pass.set_pipeline(kernel.pipeline());
                pass.set_bind_group(0, &bind_group, &[]);
                pass.dispatch_workgroups(groups[0], groups[1], 1);
            }
            gpu.queue.submit(Some(encoder.finish()));
        })?;

        gpu.device.poll(wgpu::PollType::Wait)?;
        tracing::trace!(kernel = kernel.name(), gx, gy, "dispatched");
        Ok(())
    }
}
