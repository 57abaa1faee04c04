//! Batched values paired with their gradient.

use crate::backend::Residency;
use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::real::Real;
use crate::session::Session;
use std::sync::Arc;

/// A batch of samples: data and gradient buffers of equal length.
///
/// `shape` describes one sample; the buffers hold `batch` samples back to
/// back. Both buffers are released when the tensor is dropped.
#[derive(Debug)]
pub struct Tensor {
    /// Values.
    pub data: Buffer,
    /// Gradient with respect to [`data`](Self::data).
    pub grad: Buffer,
    shape: Vec<usize>,
    batch: usize,
    producer: Option<Arc<str>>,
    name: Option<String>,
}

fn volume(shape: &[usize]) -> usize {
    shape.iter().product()
}

impl Tensor {
    /// A single sample whose shape is its length.
    #[must_use]
    pub fn from_vec(values: Vec<Real>) -> Self {
        let len = values.len();
        Self::assemble(Buffer::from_vec(values), Buffer::zeros(len), vec![len], 1)
    }

    /// `batch` samples of `shape`, laid out sample after sample.
    ///
    /// # Errors
    ///
    /// [`Error::LengthMismatch`] if `values` does not hold exactly `batch`
    /// samples.
    pub fn batched(values: Vec<Real>, shape: impl Into<Vec<usize>>, batch: usize) -> Result<Self> {
        let shape = shape.into();
        let expected = volume(&shape) * batch;
        if values.len() != expected {
            return Err(Error::LengthMismatch {
                expected,
                got: values.len(),
            });
        }
        let len = values.len();
        Ok(Self::assemble(
            Buffer::from_vec(values),
            Buffer::zeros(len),
            shape,
            batch,
        ))
    }

    /// Zero data and gradient.
    #[must_use]
    pub fn zeros(shape: impl Into<Vec<usize>>, batch: usize) -> Self {
        let shape = shape.into();
        let len = volume(&shape) * batch;
        Self::assemble(Buffer::zeros(len), Buffer::zeros(len), shape, batch)
    }

    /// Wraps existing buffers.
    ///
    /// # Errors
    ///
    /// [`Error::LengthMismatch`] if either buffer's length disagrees with
    /// `shape` and `batch`.
    pub fn from_parts(
        data: Buffer,
        grad: Buffer,
        shape: impl Into<Vec<usize>>,
        batch: usize,
    ) -> Result<Self> {
        let shape = shape.into();
        let expected = volume(&shape) * batch;
        for got in [data.len(), grad.len()] {
            if got != expected {
                return Err(Error::LengthMismatch { expected, got });
            }
        }
        Ok(Self::assemble(data, grad, shape, batch))
    }

    fn assemble(data: Buffer, grad: Buffer, shape: Vec<usize>, batch: usize) -> Self {
        Self {
            data,
            grad,
            shape,
            batch,
            producer: None,
            name: None,
        }
    }

    /// Sets a display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub(crate) fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    pub(crate) fn set_producer(&mut self, producer: Arc<str>) {
        self.producer = Some(producer);
    }

    /// Display name, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Name of the layer whose forward pass produced this tensor.
    #[must_use]
    pub fn producer(&self) -> Option<&str> {
        self.producer.as_deref()
    }

    /// Shape of one sample.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of samples.
    #[must_use]
    pub fn batch(&self) -> usize {
        self.batch
    }

    /// Elements per sample.
    #[must_use]
    pub fn sample_len(&self) -> usize {
        volume(&self.shape)
    }

    /// Elements across the whole batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the tensor holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Moves data and gradient to `target` together.
    ///
    /// # Errors
    ///
    /// Same as [`Buffer::migrate`].
    pub fn migrate(&mut self, session: &Session, target: Residency) -> Result<()> {
        self.data.migrate(session, target, true)?;
        self.grad.migrate(session, target, true)?;
        Ok(())
    }

    /// Zeroes the gradient in place.
    ///
    /// # Errors
    ///
    /// Same as [`Buffer::fill_zero`].
    pub fn clear_grad(&mut self) -> Result<()> {
        self.grad.fill_zero()
    }

    /// Frees both buffers now rather than at drop.
    pub fn release(&mut self) {
        self.data.release();
        self.grad.release();
    }
}

impl Drop for Tensor {
    fn drop(&mut self) {
        self.release();
    }
}
