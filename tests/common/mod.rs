#![allow(dead_code)]

use std::sync::OnceLock;
use weft_nn::Real;
use weft_nn::real::reals;
use weft_nn::session::{Session, SessionConfig};

/// Session shared by device tests; `None` when no adapter is available.
pub fn device_session() -> Option<Session> {
    static SESSION: OnceLock<Option<Session>> = OnceLock::new();
    SESSION
        .get_or_init(|| {
            let session = Session::initialize(SessionConfig::default()).ok()?;
            session.enabled().then_some(session)
        })
        .clone()
}

/// A session of its own, for tests that watch the allocation counter.
pub fn private_device_session() -> Option<Session> {
    let session = Session::initialize(SessionConfig::default()).ok()?;
    session.enabled().then_some(session)
}

pub fn weights_5x5() -> Vec<Real> {
    reals(&[
        -0.02690255, 0.08830735, -0.02041466, -0.0431439, -0.07749002,
        -0.06963444, -0.03971611, 0.0597842, 0.08824182, -0.06649109,
        -0.04966073, -0.04697048, -0.02235234, -0.09396666, 0.073189,
        0.06563969, 0.04446745, -0.07192299, 0.06784364, 0.09575776,
        0.05012317, -0.08874852, -0.05977172, -0.05910181, -0.06009106,
    ])
}

pub fn input_5() -> Vec<Real> {
    reals(&[0.01618112, -0.08296648, -0.05545357, 0.00389254, -0.05727582])
}

pub fn upstream_5() -> Vec<Real> {
    reals(&[
        -2.42022760e-02,
        5.02482988e-04,
        2.52015481e-04,
        8.08797951e-04,
        -7.19293347e-03,
    ])
}

pub fn assert_close(a: &[Real], b: &[Real]) {
    assert_eq!(a.len(), b.len(), "length differs: {a:?} vs {b:?}");
    for (x, y) in a.iter().zip(b) {
        assert!((x - y).abs() < 1e-5, "{a:?} != {b:?}");
    }
}
