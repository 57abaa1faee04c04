use weft_nn::Real;
use weft_nn::init::Initializer;
use weft_nn::linear::{Linear, LinearConfig};
use weft_nn::session::Session;
use weft_nn::tensor::Tensor;

fn std_dev(values: &[Real]) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().map(|&v| f64::from(v)).sum::<f64>() / n;
    let var = values.iter().map(|&v| (f64::from(v) - mean).powi(2)).sum::<f64>() / n;
    var.sqrt()
}

#[test]
fn test_seeded_init_is_reproducible() {
    let init = Initializer::new().seed(42).workers(4);
    let mut a = Tensor::zeros([16, 8], 1);
    let mut b = Tensor::zeros([16, 8], 1);
    init.init_weight(&mut a, 1.0).unwrap();
    init.init_weight(&mut b, 1.0).unwrap();
    assert_eq!(a.data.to_vec().unwrap(), b.data.to_vec().unwrap());

    let mut c = Tensor::zeros([16, 8], 1);
    Initializer::new().seed(43).workers(4).init_weight(&mut c, 1.0).unwrap();
    assert_ne!(a.data.to_vec().unwrap(), c.data.to_vec().unwrap());
}

#[test]
fn test_every_index_is_written() {
    let mut t = Tensor::zeros([7, 13], 1);
    Initializer::new().seed(1).workers(5).init_weight(&mut t, 1.0).unwrap();
    assert!(t.data.to_vec().unwrap().iter().all(|&v| v != 0.0));
}

#[test]
fn test_scale_follows_master_scale() {
    let mut t = Tensor::zeros([100, 100], 1);
    Initializer::new().seed(7).init_weight(&mut t, 1.0).unwrap();
    let sd = std_dev(&t.data.to_vec().unwrap());
    assert!((sd - 0.05).abs() < 0.005, "std {sd}");

    let mut t = Tensor::zeros([100, 100], 1);
    Initializer::new().seed(7).init_weight(&mut t, 4.0).unwrap();
    let sd = std_dev(&t.data.to_vec().unwrap());
    assert!((sd - 0.2).abs() < 0.02, "std {sd}");
}

#[test]
fn test_linear_without_weights_is_initialized() {
    let session = Session::disabled();
    let layer = Linear::new(&session, LinearConfig::new(6, 4).seed(9)).unwrap();
    let weights = layer.weight().data.to_vec().unwrap();
    assert_eq!(weights.len(), 24);
    assert!(weights.iter().any(|&w| w != 0.0));
    assert!(layer.bias().unwrap().data.to_vec().unwrap().iter().all(|&b| b == 0.0));
}
