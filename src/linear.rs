//! Fully connected layer.
//!
//! `y = W·x + b` per sample, followed by the optional activation. The device
//! path fuses the activation into the forward kernel through the
//! `ForwardActivate` insertion point of the `Linear` template.

use crate::activation::Activation;
use crate::backend::{Access, MemoryHint, Residency};
use crate::error::{Error, Result};
use crate::function::{FunctionCore, FusedLayer, Function, KernelSet};
use crate::init::Initializer;
use crate::real::Real;
use crate::session::{Dims, Session};
use crate::tensor::Tensor;
use std::sync::Arc;

/// Kernel identity of the layer.
pub const LINEAR: &str = "Linear";

const FORWARD_ACTIVATE_SLOT: &str = "ForwardActivate";
const FORWARD_ACTIVATE: &str = "sum = ForwardActivate(sum);";

const GY: &str = "gy";
const GX: &str = "gx";

/// A [`Function`] running a [`Dense`] layer.
pub type Linear = Function<Dense>;

/// Construction options for [`Linear`].
#[derive(Debug, Clone)]
pub struct LinearConfig {
    /// Inputs per sample.
    pub input_count: usize,
    /// Outputs per sample.
    pub output_count: usize,
    /// Leave out the bias term.
    pub no_bias: bool,
    /// Row-major `output_count x input_count` weights; random when `None`.
    pub initial_weight: Option<Vec<Real>>,
    /// `output_count` biases; zeros when `None`.
    pub initial_bias: Option<Vec<Real>>,
    /// Activation fused after the affine map.
    pub activation: Option<Arc<dyn Activation>>,
    /// Function name, also used to tag outputs.
    pub name: String,
    /// Start in device mode if the session is enabled.
    pub device: bool,
    /// Seed for the weight initializer.
    pub seed: Option<u64>,
}

impl LinearConfig {
    /// Defaults for an `input_count -> output_count` layer with bias.
    #[must_use]
    pub fn new(input_count: usize, output_count: usize) -> Self {
        Self {
            input_count,
            output_count,
            no_bias: false,
            initial_weight: None,
            initial_bias: None,
            activation: None,
            name: LINEAR.to_string(),
            device: false,
            seed: None,
        }
    }

    /// Drops the bias term.
    #[must_use]
    pub fn no_bias(mut self) -> Self {
        self.no_bias = true;
        self
    }

    /// Sets the initial weights.
    #[must_use]
    pub fn weight(mut self, weight: Vec<Real>) -> Self {
        self.initial_weight = Some(weight);
        self
    }

    /// Sets the initial bias.
    #[must_use]
    pub fn bias(mut self, bias: Vec<Real>) -> Self {
        self.initial_bias = Some(bias);
        self
    }

    /// Fuses `activation` into the layer.
    #[must_use]
    pub fn activation(mut self, activation: impl Activation + 'static) -> Self {
        self.activation = Some(Arc::new(activation));
        self
    }

    /// Names the function.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Requests device mode at construction.
    #[must_use]
    pub fn device(mut self, device: bool) -> Self {
        self.device = device;
        self
    }

    /// Seeds the weight initializer.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// Parameters of a fully connected layer.
#[derive(Debug)]
pub struct Dense {
    weight: Tensor,
    bias: Option<Tensor>,
    input_count: usize,
    output_count: usize,
}

impl Dense {
    /// `output_count x input_count` weight matrix.
    #[must_use]
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Bias vector, absent with `no_bias`.
    #[must_use]
    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// Inputs per sample.
    #[must_use]
    pub fn input_count(&self) -> usize {
        self.input_count
    }

    /// Outputs per sample.
    #[must_use]
    pub fn output_count(&self) -> usize {
        self.output_count
    }

    fn check_input(&self, x: &Tensor) -> Result<()> {
        if x.len() != x.batch() * self.input_count {
            return Err(Error::ShapeMismatch {
                expected: vec![x.batch(), self.input_count],
                got: vec![x.batch(), x.sample_len()],
            });
        }
        Ok(())
    }

    fn check_pair(&self, y: &Tensor, x: &Tensor) -> Result<()> {
        let batch = y.batch();
        if y.data.len() != batch * self.output_count || y.grad.len() != y.data.len() {
            return Err(Error::ShapeMismatch {
                expected: vec![batch, self.output_count],
                got: vec![batch, y.sample_len()],
            });
        }
        if x.batch() != batch || x.len() != batch * self.input_count {
            return Err(Error::ShapeMismatch {
                expected: vec![batch, self.input_count],
                got: vec![x.batch(), x.sample_len()],
            });
        }
        Ok(())
    }
}

/// Bias broadcast over the batch, the starting value of every output.
fn biased(bias: Option<&mut Tensor>, session: &Session, batch: usize, out: usize) -> Result<Vec<Real>> {
    let Some(bias) = bias else {
        return Ok(vec![0.0; batch * out]);
    };
    let data = bias.data.scoped(session, Residency::Host)?;
    Ok(data.host()?.repeat(batch))
}

/// Upstream gradient multiplied by the activation derivative.
fn activated_gy(activation: Option<&dyn Activation>, y: &Tensor) -> Result<Vec<Real>> {
    let gy = y.grad.to_vec()?;
    let Some(activation) = activation else {
        return Ok(gy);
    };
    let out = y.data.to_vec()?;
    Ok(gy
        .iter()
        .zip(&out)
        .map(|(&g, &o)| activation.backward(g, o))
        .collect())
}

fn accumulate_bias(bias: &mut Tensor, session: &Session, gy: &[Real], out: usize) -> Result<()> {
    let mut grad = bias.grad.scoped(session, Residency::Host)?;
    let grad = grad.host_mut()?;
    for row in gy.chunks_exact(out) {
        for (g, d) in grad.iter_mut().zip(row) {
            *g += d;
        }
    }
    Ok(())
}

impl FusedLayer for Dense {
    fn forward_host(&mut self, core: &mut FunctionCore, x: &mut Tensor) -> Result<Tensor> {
        self.check_input(x)?;
        let session = core.session().clone();
        let (batch, out, inp) = (x.batch(), self.output_count, self.input_count);

        let mut y = biased(self.bias.as_mut(), &session, batch, out)?;
        {
            let xd = x.data.scoped(&session, Residency::Host)?;
            let wd = self.weight.data.scoped(&session, Residency::Host)?;
            let (xs, ws) = (xd.host()?, wd.host()?);
            // accumulate onto the bias in input order, as the kernel does
            for b in 0..batch {
                for i in 0..out {
                    let acc = &mut y[b * out + i];
                    for j in 0..inp {
                        *acc += xs[b * inp + j] * ws[i * inp + j];
                    }
                }
            }
        }

        if let Some(activation) = core.activation() {
            for v in &mut y {
                *v = activation.forward(*v);
            }
        }
        Tensor::batched(y, [out], batch)
    }

    fn forward_device(
        &mut self,
        core: &mut FunctionCore,
        kernels: &KernelSet,
        x: &mut Tensor,
    ) -> Result<Tensor> {
        self.check_input(x)?;
        let session = core.session().clone();
        let (batch, out) = (x.batch(), self.output_count);

        let init = biased(self.bias.as_mut(), &session, batch, out)?;
        let mut y = Tensor::batched(init, [out], batch)?;
        y.migrate(&session, Residency::Device)?;

        let xd = x.data.scoped(&session, Residency::Device)?;
        let wd = self.weight.data.scoped(&session, Residency::Device)?;
        session.dispatch(
            &kernels.forward,
            &[
                (1, xd.device(Access::Read)?),
                (2, wd.device(Access::Read)?),
                (3, y.data.device(Access::Write)?),
            ],
            Dims::new(batch, out, self.input_count)?,
            [out, batch],
        )?;
        Ok(y)
    }

    fn backward_host(&mut self, core: &mut FunctionCore, y: &mut Tensor, x: &mut Tensor) -> Result<()> {
        self.check_pair(y, x)?;
        let session = core.session().clone();
        let (batch, out, inp) = (y.batch(), self.output_count, self.input_count);

        let gy = activated_gy(core.activation(), y)?;
        if let Some(bias) = self.bias.as_mut() {
            accumulate_bias(bias, &session, &gy, out)?;
        }

        let xd = x.data.scoped(&session, Residency::Host)?;
        let mut xg = x.grad.scoped(&session, Residency::Host)?;
        let wd = self.weight.data.scoped(&session, Residency::Host)?;
        let mut wg = self.weight.grad.scoped(&session, Residency::Host)?;
        let (xs, ws) = (xd.host()?, wd.host()?);
        let (xgs, wgs) = (xg.host_mut()?, wg.host_mut()?);

        for b in 0..batch {
            for i in 0..out {
                let g = gy[b * out + i];
                for j in 0..inp {
                    wgs[i * inp + j] += xs[b * inp + j] * g;
                    xgs[b * inp + j] += ws[i * inp + j] * g;
                }
            }
        }
        Ok(())
    }

    fn backward_device(
        &mut self,
        core: &mut FunctionCore,
        kernels: &KernelSet,
        y: &mut Tensor,
        x: &mut Tensor,
    ) -> Result<()> {
        self.check_pair(y, x)?;
        let session = core.session().clone();
        let (batch, out) = (y.batch(), self.output_count);

        let gy = activated_gy(core.activation(), y)?;
        if let Some(bias) = self.bias.as_mut() {
            accumulate_bias(bias, &session, &gy, out)?;
        }

        {
            let staged = core.buffers_mut().declare(GY, gy.len(), MemoryHint::ReadOnly);
            staged.write(&gy)?;
            staged.migrate(&session, Residency::Device, true)?;
        }
        core.buffers_mut()
            .declare(GX, x.len(), MemoryHint::ReadWrite)
            .migrate(&session, Residency::Device, true)?;

        {
            let dims = Dims::new(batch, out, self.input_count)?;
            let gy_dev = core.buffers().get(GY)?.device(Access::Read)?;
            let gx_dev = core.buffers().get(GX)?.device(Access::Write)?;
            let xd = x.data.scoped(&session, Residency::Device)?;
            let wd = self.weight.data.scoped(&session, Residency::Device)?;
            let wg = self.weight.grad.scoped(&session, Residency::Device)?;

            session.dispatch(
                &kernels.weight_grad,
                &[
                    (1, xd.device(Access::Read)?),
                    (4, gy_dev),
                    (5, wg.device(Access::Write)?),
                ],
                dims,
                [self.input_count, out],
            )?;
            session.dispatch(
                &kernels.input_grad,
                &[
                    (2, wd.device(Access::Read)?),
                    (4, gy_dev),
                    (6, gx_dev),
                ],
                dims,
                [self.input_count, batch],
            )?;
        }

        let gx = core.buffers().get(GX)?.to_vec()?;
        let mut xg = x.grad.scoped(&session, Residency::Host)?;
        for (acc, g) in xg.host_mut()?.iter_mut().zip(&gx) {
            *acc += g;
        }
        Ok(())
    }

    fn parameters(&self) -> Vec<&Tensor> {
        std::iter::once(&self.weight).chain(self.bias.as_ref()).collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        std::iter::once(&mut self.weight).chain(self.bias.as_mut()).collect()
    }
}

impl Function<Dense> {
    /// Builds a fully connected layer.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for zero sizes or initial arrays of the wrong
    /// length, plus everything [`Function::with_layer`] reports.
    pub fn new(session: &Session, config: LinearConfig) -> Result<Self> {
        let LinearConfig {
            input_count,
            output_count,
            no_bias,
            initial_weight,
            initial_bias,
            activation,
            name,
            device,
            seed,
        } = config;

        if input_count == 0 || output_count == 0 {
            return Err(Error::Config(format!(
                "`{name}` needs non-zero sizes, got {input_count} -> {output_count}"
            )));
        }

        let mut weight = match initial_weight {
            Some(values) => {
                if values.len() != output_count * input_count {
                    return Err(Error::Config(format!(
                        "`{name}` initial weight has {} elements, expected {}",
                        values.len(),
                        output_count * input_count
                    )));
                }
                Tensor::batched(values, [output_count, input_count], 1)?
            }
            None => {
                let mut weight = Tensor::zeros([output_count, input_count], 1);
                let initializer = match seed {
                    Some(seed) => Initializer::new().seed(seed),
                    None => Initializer::new(),
                };
                initializer.init_weight(&mut weight, 1.0)?;
                weight
            }
        };
        weight.set_name(format!("{name} Weight"));

        let bias = match (no_bias, initial_bias) {
            (true, Some(_)) => {
                return Err(Error::Config(format!("`{name}` has no bias but one was given")));
            }
            (true, None) => None,
            (false, Some(values)) => {
                if values.len() != output_count {
                    return Err(Error::Config(format!(
                        "`{name}` initial bias has {} elements, expected {output_count}",
                        values.len()
                    )));
                }
                Some(Tensor::batched(values, [output_count], 1)?)
            }
            (false, None) => Some(Tensor::zeros([output_count], 1)),
        };
        let bias = bias.map(|b| b.with_name(format!("{name} Bias")));

        let layer = Dense {
            weight,
            bias,
            input_count,
            output_count,
        };
        Self::with_layer(
            session,
            LINEAR,
            name,
            vec![(FORWARD_ACTIVATE_SLOT.to_string(), FORWARD_ACTIVATE.to_string())],
            activation,
            layer,
            device,
        )
    }

    /// The weight tensor.
    #[must_use]
    pub fn weight(&self) -> &Tensor {
        self.layer().weight()
    }

    /// The bias tensor, if present.
    #[must_use]
    pub fn bias(&self) -> Option<&Tensor> {
        self.layer().bias()
    }
}
