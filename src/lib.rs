//! # `weft_nn`
//!
//! Layer execution engine with buffers that live on the host or on a `wgpu`
//! device, and layers whose activation is fused into their compute kernels.
//!
//! ## Features
//!
//! - **Buffers**: one valid copy at a time, explicit migration, scoped
//!   restore guards and leak tracking
//! - **Session**: explicit accelerator context with device selection,
//!   program caching and synchronous dispatch
//! - **Fusable layers**: host and device passes behind one mode switch, with
//!   activation code spliced into kernel templates
//! - **Linear**: fully connected layer with gradient accumulation on both paths
//!
//! ## Example
//!
//! ```no_run
//! use weft_nn::activation::Relu;
//! use weft_nn::linear::{Linear, LinearConfig};
//! use weft_nn::session::{Session, SessionConfig};
//! use weft_nn::tensor::Tensor;
//!
//! let session = Session::initialize(SessionConfig::default())?;
//! let mut layer = Linear::new(
//!     &session,
//!     LinearConfig::new(3, 2).activation(Relu).device(true).seed(7),
//! )?;
//!
//! let mut x = Tensor::from_vec(vec![0.5, -1.0, 2.0]);
//! let mut y = layer.forward(&mut x)?;
//! y.grad.write(&[1.0, 1.0])?;
//! layer.backward(&mut y, &mut x)?;
//! # Ok::<(), weft_nn::Error>(())
//! ```

#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::many_single_char_names,
    clippy::cast_possible_truncation,
    clippy::similar_names,
    clippy::cast_precision_loss,
    clippy::unnecessary_cast,
    clippy::missing_panics_doc
)]
#![deny(unsafe_code)]
#![forbid(missing_docs)]

pub mod activation;
pub mod approx;
pub mod backend;
pub mod buffer;
pub mod error;
pub mod function;
pub mod init;
pub mod linear;
pub mod real;
pub mod session;
pub mod template;
pub mod tensor;

pub use error::{Error, Result};
pub use real::Real;
