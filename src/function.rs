//! The fusable compute-function base.
//!
//! [`Function`] owns what every fusable layer shares: the session, the kernel
//! template, the optional activation, named auxiliary buffers and the current
//! [`Mode`]. A concrete layer implements [`FusedLayer`] with a host and a
//! device version of its forward and backward passes; `Function` picks one of
//! them per call based on the mode.
//!
//! In device mode the compiled kernels live inside [`Mode::Device`], so
//! replacing them and switching mode is a single assignment and a stale
//! kernel set can never be dispatched.

use crate::activation::Activation;
use crate::backend::{MemoryHint, Residency};
use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::session::{self, Kernel, Session};
use crate::template::KernelTemplate;
use crate::tensor::Tensor;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Insertion point receiving the activation's `ForwardActivate` definition.
pub const ACTIVATION_SLOT: &str = "ActivationFunction";

/// Entry-point names derived from a layer identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelNames {
    /// `<Identity>Forward`.
    pub forward: String,
    /// `<Identity>gWBackward`.
    pub weight_grad: String,
    /// `<Identity>gXBackward`.
    pub input_grad: String,
}

impl KernelNames {
    /// Derives the three names from `identity`.
    #[must_use]
    pub fn new(identity: &str) -> Self {
        Self {
            forward: format!("{identity}Forward"),
            weight_grad: format!("{identity}gWBackward"),
            input_grad: format!("{identity}gXBackward"),
        }
    }

    fn all(&self) -> [&str; 3] {
        [&self.forward, &self.weight_grad, &self.input_grad]
    }
}

/// Compiled kernels for one composition of a layer's template.
#[derive(Debug, Clone)]
pub struct KernelSet {
    /// Forward pass with the activation fused in.
    pub forward: Kernel,
    /// Weight gradient, accumulated.
    pub weight_grad: Kernel,
    /// Input gradient.
    pub input_grad: Kernel,
}

/// Where a function runs its passes.
#[derive(Debug, Clone, Default)]
pub enum Mode {
    /// Host loops.
    #[default]
    Host,
    /// Device kernels, built for the current activation.
    Device(KernelSet),
}

/// Named auxiliary buffers owned by one function.
#[derive(Debug, Default)]
pub struct BufferRegistry {
    buffers: BTreeMap<String, Buffer>,
}

impl BufferRegistry {
    /// Returns the buffer called `name`, creating it if needed.
    ///
    /// An existing buffer of a different length is released and replaced by
    /// a zeroed one, so scratch space follows the batch size.
    pub fn declare(&mut self, name: &str, len: usize, hint: MemoryHint) -> &mut Buffer {
        let stale = self.buffers.get(name).is_some_and(|b| b.len() != len);
        if stale {
            if let Some(mut old) = self.buffers.remove(name) {
                old.release();
            }
        }
        self.buffers
            .entry(name.to_string())
            .or_insert_with(|| Buffer::zeros(len).with_hint(hint))
    }

    /// Adds or replaces a buffer; a replaced buffer is released.
    pub fn insert(&mut self, name: impl Into<String>, buffer: Buffer) {
        if let Some(mut old) = self.buffers.insert(name.into(), buffer) {
            old.release();
        }
    }

    /// The buffer called `name`.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if no such buffer was declared.
    pub fn get(&self, name: &str) -> Result<&Buffer> {
        self.buffers
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Mutable access to the buffer called `name`.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if no such buffer was declared.
    pub fn get_mut(&mut self, name: &str) -> Result<&mut Buffer> {
        self.buffers
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Names of all registered buffers, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.buffers.keys().map(String::as_str)
    }

    fn migrate_all(&mut self, session: &Session, target: Residency) -> Result<()> {
        for buffer in self.buffers.values_mut() {
            buffer.migrate(session, target, true)?;
        }
        Ok(())
    }
}

impl Drop for BufferRegistry {
    fn drop(&mut self) {
        for buffer in self.buffers.values_mut() {
            buffer.release();
        }
    }
}

/// State every fusable layer shares, handed to the layer's passes.
#[derive(Debug)]
pub struct FunctionCore {
    session: Session,
    name: Arc<str>,
    identity: String,
    names: KernelNames,
    template: KernelTemplate,
    fusion: Vec<(String, String)>,
    activation: Option<Arc<dyn Activation>>,
    buffers: BufferRegistry,
}

impl FunctionCore {
    /// The session this function was created with.
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kernel identity: the layer kind with spaces removed.
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Entry-point names.
    #[must_use]
    pub fn kernel_names(&self) -> &KernelNames {
        &self.names
    }

    /// The attached activation.
    #[must_use]
    pub fn activation(&self) -> Option<&dyn Activation> {
        self.activation.as_deref()
    }

    /// Auxiliary buffers.
    #[must_use]
    pub fn buffers(&self) -> &BufferRegistry {
        &self.buffers
    }

    /// Mutable auxiliary buffers.
    pub fn buffers_mut(&mut self) -> &mut BufferRegistry {
        &mut self.buffers
    }

    /// Composes kernel source for the current activation.
    ///
    /// Without an activation every insertion point is left empty.
    ///
    /// # Errors
    ///
    /// [`Error::Template`] if the template lacks a point being filled.
    pub fn kernel_source(&self) -> Result<String> {
        let mut fragments: Vec<(&str, String)> = Vec::new();
        if let Some(activation) = &self.activation {
            fragments.push((ACTIVATION_SLOT, activation.kernel_source()));
            for (slot, text) in &self.fusion {
                fragments.push((slot.as_str(), text.clone()));
            }
        }
        let fragments: Vec<(&str, &str)> = fragments.iter().map(|(s, t)| (*s, t.as_str())).collect();
        self.template.compose(&fragments)
    }

    fn build_kernels(&self) -> Result<KernelSet> {
        let source = self.kernel_source()?;
        let program = self
            .session
            .compile_program(&self.identity, &source, &self.names.all())?;
        tracing::debug!(
            function = %self.name,
            activation = self.activation.as_ref().map(|a| a.name()),
            "kernels built"
        );
        Ok(KernelSet {
            forward: program.kernel(&self.names.forward)?,
            weight_grad: program.kernel(&self.names.weight_grad)?,
            input_grad: program.kernel(&self.names.input_grad)?,
        })
    }
}

/// Host and device passes of a concrete fusable layer.
///
/// Only [`Function`] calls these; it guarantees that the device variants run
/// only in device mode with kernels built for the current activation.
pub trait FusedLayer {
    /// Forward pass on the host.
    ///
    /// # Errors
    ///
    /// Shape and residency failures.
    fn forward_host(&mut self, core: &mut FunctionCore, x: &mut Tensor) -> Result<Tensor>;

    /// Forward pass through the device kernels.
    ///
    /// # Errors
    ///
    /// Shape, residency and device failures.
    fn forward_device(
        &mut self,
        core: &mut FunctionCore,
        kernels: &KernelSet,
        x: &mut Tensor,
    ) -> Result<Tensor>;

    /// Backward pass on the host; accumulates into every gradient.
    ///
    /// # Errors
    ///
    /// Shape and residency failures.
    fn backward_host(&mut self, core: &mut FunctionCore, y: &mut Tensor, x: &mut Tensor) -> Result<()>;

    /// Backward pass through the device kernels; accumulates into every gradient.
    ///
    /// # Errors
    ///
    /// Shape, residency and device failures.
    fn backward_device(
        &mut self,
        core: &mut FunctionCore,
        kernels: &KernelSet,
        y: &mut Tensor,
        x: &mut Tensor,
    ) -> Result<()>;

    /// Parameter tensors in a fixed order.
    fn parameters(&self) -> Vec<&Tensor>;

    /// Mutable parameter tensors, same order as [`parameters`](Self::parameters).
    fn parameters_mut(&mut self) -> Vec<&mut Tensor>;
}

/// A fusable layer together with its shared state.
#[derive(Debug)]
pub struct Function<L> {
    core: FunctionCore,
    mode: Mode,
    layer: L,
}

impl<L: FusedLayer> Function<L> {
    /// Wraps `layer`, loading the kernel template registered for `kind`.
    ///
    /// `fusion` lists the insertion points filled when an activation is
    /// attached, besides the activation function itself. With `device` set
    /// the function starts in device mode if the session allows it.
    ///
    /// # Errors
    ///
    /// [`Error::MissingKernel`] or [`Error::InvalidKernel`] if no usable
    /// template exists, [`Error::Template`] if an insertion point is missing,
    /// and build errors when starting in device mode.
    pub fn with_layer(
        session: &Session,
        kind: &str,
        name: impl Into<String>,
        fusion: Vec<(String, String)>,
        activation: Option<Arc<dyn Activation>>,
        layer: L,
        device: bool,
    ) -> Result<Self> {
        let identity = kind.replace(' ', "");
        let names = KernelNames::new(&identity);
        let source = session::kernel_source(&identity)?;
        session::require_entry_points(&identity, &source, &names.all())?;
        let template = KernelTemplate::parse(&source)?;

        for slot in std::iter::once(ACTIVATION_SLOT).chain(fusion.iter().map(|(s, _)| s.as_str())) {
            if !template.has_slot(slot) {
                return Err(Error::Template(format!(
                    "`{identity}` template has no insertion point `{slot}`"
                )));
            }
        }

        let mut function = Self {
            core: FunctionCore {
                session: session.clone(),
                name: Arc::from(name.into()),
                identity,
                names,
                template,
                fusion,
                activation,
                buffers: BufferRegistry::default(),
            },
            mode: Mode::Host,
            layer,
        };
        function.enable_device(device)?;
        Ok(function)
    }

    /// Runs the forward pass in the current mode.
    ///
    /// The output records this function as its producer.
    ///
    /// # Errors
    ///
    /// Whatever the layer's pass reports.
    pub fn forward(&mut self, x: &mut Tensor) -> Result<Tensor> {
        let mut y = match &self.mode {
            Mode::Host => self.layer.forward_host(&mut self.core, x)?,
            Mode::Device(kernels) => self.layer.forward_device(&mut self.core, kernels, x)?,
        };
        y.set_producer(Arc::clone(&self.core.name));
        Ok(y)
    }

    /// Runs the backward pass in the current mode, accumulating gradients.
    ///
    /// # Errors
    ///
    /// [`Error::Precondition`] if `y` was produced by another function, and
    /// whatever the layer's pass reports.
    pub fn backward(&mut self, y: &mut Tensor, x: &mut Tensor) -> Result<()> {
        if let Some(producer) = y.producer() {
            if producer != &*self.core.name {
                return Err(Error::Precondition(format!(
                    "output of `{producer}` passed to `{}`",
                    self.core.name
                )));
            }
        }
        match &self.mode {
            Mode::Host => self.layer.backward_host(&mut self.core, y, x),
            Mode::Device(kernels) => self.layer.backward_device(&mut self.core, kernels, y, x),
        }
    }

    /// Switches between device and host execution.
    ///
    /// Returns whether the function now runs on the device. Asking for the
    /// device on a disabled session is not an error; the function stays on
    /// the host and `false` is returned.
    ///
    /// # Errors
    ///
    /// Build failures and failed migrations.
    pub fn enable_device(&mut self, enable: bool) -> Result<bool> {
        if enable && self.core.session.enabled() {
            let kernels = self.core.build_kernels()?;
            self.migrate_state(Residency::Device)?;
            self.mode = Mode::Device(kernels);
            Ok(true)
        } else {
            if enable {
                tracing::debug!(function = %self.core.name, "accelerator disabled; staying on host");
            }
            self.mode = Mode::Host;
            self.migrate_state(Residency::Host)?;
            Ok(false)
        }
    }

    /// Attaches or removes the activation.
    ///
    /// Kernel source is recomposed from the pristine template, and kernels
    /// are rebuilt when in device mode. If the rebuild fails the function
    /// falls back to host mode before reporting the error.
    ///
    /// # Errors
    ///
    /// Template and build failures.
    pub fn set_activation(&mut self, activation: Option<Arc<dyn Activation>>) -> Result<()> {
        self.core.activation = activation;
        self.core.kernel_source()?;

        if matches!(self.mode, Mode::Device(_)) {
            match self.core.build_kernels() {
                Ok(kernels) => self.mode = Mode::Device(kernels),
                Err(e) => {
                    self.mode = Mode::Host;
                    self.migrate_state(Residency::Host)?;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn migrate_state(&mut self, target: Residency) -> Result<()> {
        let session = self.core.session.clone();
        self.core.buffers.migrate_all(&session, target)?;
        for parameter in self.layer.parameters_mut() {
            parameter.migrate(&session, target)?;
        }
        Ok(())
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// The current mode.
    #[must_use]
    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    /// Returns `true` in device mode.
    #[must_use]
    pub fn is_device(&self) -> bool {
        matches!(self.mode, Mode::Device(_))
    }

    /// The attached activation.
    #[must_use]
    pub fn activation(&self) -> Option<&dyn Activation> {
        self.core.activation()
    }

    /// Kernel source for the current activation.
    ///
    /// # Errors
    ///
    /// Same as [`FunctionCore::kernel_source`].
    pub fn kernel_source(&self) -> Result<String> {
        self.core.kernel_source()
    }

    /// Shared state.
    #[must_use]
    pub fn core(&self) -> &FunctionCore {
        &self.core
    }

    /// The buffer declared under `name`.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if none was declared.
    pub fn buffer(&self, name: &str) -> Result<&Buffer> {
        self.core.buffers.get(name)
    }

    /// Registers `buffer` under `name`, moving it to the function's residency.
    ///
    /// # Errors
    ///
    /// Failed migration.
    pub fn insert(&mut self, name: impl Into<String>, mut buffer: Buffer) -> Result<()> {
        let target = if self.is_device() {
            Residency::Device
        } else {
            Residency::Host
        };
        buffer.migrate(&self.core.session, target, true)?;
        self.core.buffers.insert(name, buffer);
        Ok(())
    }

    /// Parameter tensors, for optimizers.
    #[must_use]
    pub fn parameters(&self) -> Vec<&Tensor> {
        self.layer.parameters()
    }

    /// Mutable parameter tensors, for optimizers.
    pub fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        self.layer.parameters_mut()
    }

    /// Zeroes every parameter gradient.
    ///
    /// # Errors
    ///
    /// Device failures while writing zeros.
    pub fn clear_grads(&mut self) -> Result<()> {
        for parameter in self.layer.parameters_mut() {
            parameter.clear_grad()?;
        }
        Ok(())
    }

    /// The concrete layer.
    #[must_use]
    pub fn layer(&self) -> &L {
        &self.layer
    }
}
