//! Runs a 5x5 ELU layer on the host and on the device and prints both
//! results side by side.
//!
//! ```text
//! RUST_LOG=weft_nn=debug cargo run --example linear_parity
//! ```

use tracing_subscriber::EnvFilter;
use weft_nn::activation::Elu;
use weft_nn::approx::sum_abs_diff;
use weft_nn::linear::{Linear, LinearConfig};
use weft_nn::real::reals;
use weft_nn::session::{Session, SessionConfig};
use weft_nn::tensor::Tensor;

fn layer(session: &Session, device: bool) -> weft_nn::Result<Linear> {
    let weights = reals(&[
        -0.02690255, 0.08830735, -0.02041466, -0.0431439, -0.07749002,
        -0.06963444, -0.03971611, 0.0597842, 0.08824182, -0.06649109,
        -0.04966073, -0.04697048, -0.02235234, -0.09396666, 0.073189,
        0.06563969, 0.04446745, -0.07192299, 0.06784364, 0.09575776,
        0.05012317, -0.08874852, -0.05977172, -0.05910181, -0.06009106,
    ]);
    Linear::new(
        session,
        LinearConfig::new(5, 5)
            .weight(weights)
            .activation(Elu::new(1.0))
            .name("l1")
            .device(device),
    )
}

fn run(session: &Session, device: bool) -> weft_nn::Result<[Vec<weft_nn::Real>; 3]> {
    let mut l1 = layer(session, device)?;
    let mut x = Tensor::from_vec(reals(&[
        0.01618112, -0.08296648, -0.05545357, 0.00389254, -0.05727582,
    ]));
    let mut y = l1.forward(&mut x)?;
    y.grad.write(&reals(&[
        -2.42022760e-02,
        5.02482988e-04,
        2.52015481e-04,
        8.08797951e-04,
        -7.19293347e-03,
    ]))?;
    l1.backward(&mut y, &mut x)?;
    Ok([y.data.to_vec()?, l1.weight().grad.to_vec()?, x.grad.to_vec()?])
}

fn main() -> weft_nn::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let session = Session::initialize(SessionConfig::default())?;
    let host = run(&session, false)?;
    println!("host   y  = {:?}", host[0]);

    if !session.enabled() {
        println!("no compute device; host results only");
        return Ok(());
    }

    let device = run(&session, true)?;
    println!("device y  = {:?}", device[0]);
    for (label, (h, d)) in ["y", "gW", "gx"].iter().zip(host.iter().zip(&device)) {
        println!("{label:>3}: sum |host - device| = {:?}", sum_abs_diff(h, d));
    }
    Ok(())
}
