mod common;

use common::{assert_close, device_session, input_5, upstream_5, weights_5x5};
use std::sync::Arc;
use weft_nn::Real;
use weft_nn::activation::{Elu, Relu, Tanh};
use weft_nn::approx::close;
use weft_nn::backend::Residency;
use weft_nn::linear::{Linear, LinearConfig};
use weft_nn::session::Session;
use weft_nn::tensor::Tensor;
use weft_nn::{Error, Result};

fn small_layer(session: &Session, device: bool) -> Result<Linear> {
    Linear::new(
        session,
        LinearConfig::new(3, 2)
            .weight(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
            .bias(vec![0.5, -1.0])
            .device(device),
    )
}

fn five_by_five(session: &Session, device: bool) -> Result<Linear> {
    Linear::new(
        session,
        LinearConfig::new(5, 5)
            .weight(weights_5x5())
            .activation(Elu::new(1.0))
            .name("l1")
            .device(device),
    )
}

#[test]
fn test_host_forward_hand_computed() {
    let session = Session::disabled();
    let mut layer = small_layer(&session, false).unwrap();
    let mut x = Tensor::from_vec(vec![1.0, 0.0, -1.0]);
    let y = layer.forward(&mut x).unwrap();

    assert_eq!(y.shape(), [2]);
    assert_eq!(y.batch(), 1);
    assert_eq!(y.producer(), Some("Linear"));
    assert_close(&y.data.to_vec().unwrap(), &[-1.5, -3.0]);
    assert_close(&y.grad.to_vec().unwrap(), &[0.0, 0.0]);
}

#[test]
fn test_host_forward_batched_with_relu() {
    let session = Session::disabled();
    let mut layer = small_layer(&session, false).unwrap();
    layer.set_activation(Some(Arc::new(Relu))).unwrap();

    let mut x = Tensor::batched(vec![1.0, 0.0, -1.0, 1.0, 1.0, 1.0], [3], 2).unwrap();
    let y = layer.forward(&mut x).unwrap();
    // second sample: [6.5, 14.0]
    assert_close(&y.data.to_vec().unwrap(), &[0.0, 0.0, 6.5, 14.0]);
}

#[test]
fn test_host_backward_accumulates() {
    let session = Session::disabled();
    let mut layer = small_layer(&session, false).unwrap();
    let mut x = Tensor::from_vec(vec![1.0, 0.0, -1.0]);
    let mut y = layer.forward(&mut x).unwrap();
    y.grad.write(&[1.0, 2.0]).unwrap();

    layer.backward(&mut y, &mut x).unwrap();
    assert_close(&layer.weight().grad.to_vec().unwrap(), &[1.0, 0.0, -1.0, 2.0, 0.0, -2.0]);
    assert_close(&layer.bias().unwrap().grad.to_vec().unwrap(), &[1.0, 2.0]);
    assert_close(&x.grad.to_vec().unwrap(), &[9.0, 12.0, 15.0]);

    layer.backward(&mut y, &mut x).unwrap();
    assert_close(&layer.weight().grad.to_vec().unwrap(), &[2.0, 0.0, -2.0, 4.0, 0.0, -4.0]);
    assert_close(&layer.bias().unwrap().grad.to_vec().unwrap(), &[2.0, 4.0]);
    assert_close(&x.grad.to_vec().unwrap(), &[18.0, 24.0, 30.0]);

    layer.clear_grads().unwrap();
    assert_close(&layer.weight().grad.to_vec().unwrap(), &[0.0; 6]);
}

#[test]
fn test_host_weight_grad_matches_finite_difference() {
    // loss = sum(gy * y), so dloss/dW is exactly what backward accumulates
    let session = Session::disabled();
    let gy = upstream_5();
    let loss = |weights: Vec<Real>| -> Real {
        let mut layer = Linear::new(
            &session,
            LinearConfig::new(5, 5).weight(weights).activation(Elu::new(1.0)),
        )
        .unwrap();
        let mut x = Tensor::from_vec(input_5());
        let y = layer.forward(&mut x).unwrap();
        y.data.to_vec().unwrap().iter().zip(&gy).map(|(a, b)| a * b).sum()
    };

    let mut layer = five_by_five(&session, false).unwrap();
    let mut x = Tensor::from_vec(input_5());
    let mut y = layer.forward(&mut x).unwrap();
    y.grad.write(&gy).unwrap();
    layer.backward(&mut y, &mut x).unwrap();
    let analytic = layer.weight().grad.to_vec().unwrap();

    let h: Real = 1e-2;
    for index in [0, 7, 18, 24] {
        let mut plus = weights_5x5();
        plus[index] += h;
        let mut minus = weights_5x5();
        minus[index] -= h;
        let numeric = (loss(plus) - loss(minus)) / (2.0 * h);
        assert!(
            (numeric - analytic[index]).abs() < 1e-5,
            "weight {index}: numeric {numeric} analytic {}",
            analytic[index]
        );
    }
}

#[test]
fn test_disabled_session_stays_on_host() {
    let session = Session::disabled();
    let mut layer = five_by_five(&session, true).unwrap();
    assert!(!layer.is_device());
    assert!(!layer.enable_device(true).unwrap());
    assert!(!layer.enable_device(false).unwrap());

    let mut x = Tensor::from_vec(input_5());
    let y = layer.forward(&mut x).unwrap();
    assert_eq!(y.data.residency(), Residency::Host);
}

#[test]
fn test_config_errors() {
    let session = Session::disabled();
    let short = Linear::new(&session, LinearConfig::new(3, 2).weight(vec![0.0; 5]));
    assert!(matches!(short, Err(Error::Config(_))));

    let bias = Linear::new(&session, LinearConfig::new(3, 2).bias(vec![0.0; 3]));
    assert!(matches!(bias, Err(Error::Config(_))));

    let both = Linear::new(&session, LinearConfig::new(3, 2).no_bias().bias(vec![0.0; 2]));
    assert!(matches!(both, Err(Error::Config(_))));

    let empty = Linear::new(&session, LinearConfig::new(0, 2));
    assert!(matches!(empty, Err(Error::Config(_))));
}

#[test]
fn test_no_bias_parameters() {
    let session = Session::disabled();
    let with_bias = Linear::new(&session, LinearConfig::new(4, 3).seed(1)).unwrap();
    let without = Linear::new(&session, LinearConfig::new(4, 3).no_bias().seed(1)).unwrap();
    assert_eq!(with_bias.parameters().len(), 2);
    assert_eq!(without.parameters().len(), 1);
    assert_eq!(without.parameters()[0].shape(), [3, 4]);
    assert!(without.bias().is_none());
}

#[test]
fn test_backward_rejects_foreign_output() {
    let session = Session::disabled();
    let mut a = small_layer(&session, false).unwrap();
    let mut b = Linear::new(
        &session,
        LinearConfig::new(3, 2).name("other").seed(3),
    )
    .unwrap();

    let mut x = Tensor::from_vec(vec![1.0, 2.0, 3.0]);
    let mut y = a.forward(&mut x).unwrap();
    assert!(matches!(b.backward(&mut y, &mut x), Err(Error::Precondition(_))));
}

#[test]
fn test_backward_checks_shapes() {
    let session = Session::disabled();
    let mut layer = small_layer(&session, false).unwrap();
    let mut x = Tensor::from_vec(vec![1.0, 2.0, 3.0]);
    let mut y = Tensor::from_vec(vec![0.0; 3]);
    assert!(matches!(
        layer.backward(&mut y, &mut x),
        Err(Error::ShapeMismatch { .. })
    ));

    let mut wrong_x = Tensor::from_vec(vec![1.0, 2.0]);
    assert!(matches!(
        layer.forward(&mut wrong_x),
        Err(Error::ShapeMismatch { .. })
    ));
}

#[test]
fn test_activation_reattach_recomposes_from_template() {
    let session = Session::disabled();
    let mut layer = five_by_five(&session, false).unwrap();
    let elu = layer.kernel_source().unwrap();
    assert!(elu.contains("sum = ForwardActivate(sum);"));
    assert!(!elu.contains("/*@"));

    layer.set_activation(Some(Arc::new(Tanh))).unwrap();
    let tanh = layer.kernel_source().unwrap();
    assert!(tanh.contains("tanh(x)"));
    assert_eq!(tanh.matches("fn ForwardActivate").count(), 1);

    layer.set_activation(Some(Arc::new(Elu::new(1.0)))).unwrap();
    assert_eq!(layer.kernel_source().unwrap(), elu);

    layer.set_activation(None).unwrap();
    let plain = layer.kernel_source().unwrap();
    assert!(!plain.contains("ForwardActivate"));
    assert!(layer.activation().is_none());
}

#[test]
fn test_5x5_host_device_parity() {
    let Some(session) = device_session() else {
        eprintln!("no compute device; skipping");
        return;
    };

    let mut host = five_by_five(&session, false).unwrap();
    let mut device = five_by_five(&session, true).unwrap();
    assert!(device.is_device());

    let mut x_host = Tensor::from_vec(input_5());
    let mut x_device = Tensor::from_vec(input_5());
    let mut y_host = host.forward(&mut x_host).unwrap();
    let mut y_device = device.forward(&mut x_device).unwrap();

    assert_eq!(y_device.data.residency(), Residency::Device);
    assert_eq!(x_device.data.residency(), Residency::Host);
    let (yh, yd) = (y_host.data.to_vec().unwrap(), y_device.data.to_vec().unwrap());
    assert!(close(&yh[..], &yd[..]), "{yh:?} vs {yd:?}");

    y_host.grad.write(&upstream_5()).unwrap();
    y_device.grad.write(&upstream_5()).unwrap();
    host.backward(&mut y_host, &mut x_host).unwrap();
    device.backward(&mut y_device, &mut x_device).unwrap();

    let pairs = [
        (host.weight().grad.to_vec().unwrap(), device.weight().grad.to_vec().unwrap()),
        (
            host.bias().unwrap().grad.to_vec().unwrap(),
            device.bias().unwrap().grad.to_vec().unwrap(),
        ),
        (x_host.grad.to_vec().unwrap(), x_device.grad.to_vec().unwrap()),
    ];
    for (h, d) in &pairs {
        assert!(close(&h[..], &d[..]), "{h:?} vs {d:?}");
    }
    assert_eq!(device.weight().grad.residency(), Residency::Device);
}

#[test]
fn test_device_gradients_double() {
    let Some(session) = device_session() else {
        eprintln!("no compute device; skipping");
        return;
    };

    let mut layer = five_by_five(&session, true).unwrap();
    let mut x = Tensor::batched([input_5(), input_5()].concat(), [5], 2).unwrap();
    let mut y = layer.forward(&mut x).unwrap();
    y.grad.write(&[upstream_5(), upstream_5()].concat()).unwrap();

    layer.backward(&mut y, &mut x).unwrap();
    let once_w = layer.weight().grad.to_vec().unwrap();
    let once_x = x.grad.to_vec().unwrap();

    layer.backward(&mut y, &mut x).unwrap();
    let twice_w = layer.weight().grad.to_vec().unwrap();
    let twice_x = x.grad.to_vec().unwrap();

    let doubled = |v: &[Real]| v.iter().map(|g| 2.0 * g).collect::<Vec<_>>();
    assert!(close(&twice_w[..], &doubled(&once_w)[..]));
    assert!(close(&twice_x[..], &doubled(&once_x)[..]));
}

#[test]
fn test_device_activation_swap_keeps_parity() {
    let Some(session) = device_session() else {
        eprintln!("no compute device; skipping");
        return;
    };

    let mut host = five_by_five(&session, false).unwrap();
    let mut device = five_by_five(&session, true).unwrap();
    for layer in [&mut host, &mut device] {
        layer.set_activation(Some(Arc::new(Tanh))).unwrap();
    }
    assert!(device.is_device());

    let mut x = Tensor::from_vec(input_5());
    let yh = host.forward(&mut x).unwrap().data.to_vec().unwrap();
    let yd = device.forward(&mut x).unwrap().data.to_vec().unwrap();
    assert!(close(&yh[..], &yd[..]), "{yh:?} vs {yd:?}");
}

#[test]
fn test_switching_modes_moves_parameters() {
    let Some(session) = device_session() else {
        eprintln!("no compute device; skipping");
        return;
    };

    let mut layer = five_by_five(&session, false).unwrap();
    assert_eq!(layer.weight().data.residency(), Residency::Host);
    assert!(layer.enable_device(true).unwrap());
    assert_eq!(layer.weight().data.residency(), Residency::Device);
    assert_eq!(layer.weight().grad.residency(), Residency::Device);
    assert!(!layer.enable_device(false).unwrap());
    assert_eq!(layer.weight().data.residency(), Residency::Host);
    assert_close(&layer.weight().data.to_vec().unwrap(), &weights_5x5());
}

/// `gW = outer(gy, x)` and `gX = Wᵀ·gy` for a single sample.
fn matrix_reference(w: &[Real], x: &[Real], gy: &[Real]) -> (Vec<Real>, Vec<Real>) {
    let (out, inp) = (gy.len(), x.len());
    let gw = (0..out * inp).map(|k| gy[k / inp] * x[k % inp]).collect();
    let gx = (0..inp)
        .map(|j| (0..out).map(|i| w[i * inp + j] * gy[i]).sum::<Real>())
        .collect();
    (gw, gx)
}

fn check_5x5_gradients(session: &Session, device: bool, elu: bool) {
    let mut config = LinearConfig::new(5, 5).weight(weights_5x5()).device(device);
    if elu {
        config = config.activation(Elu::new(1.0));
    }
    let mut layer = Linear::new(session, config).unwrap();
    assert_eq!(layer.is_device(), device);

    let mut x = Tensor::from_vec(input_5());
    let mut y = layer.forward(&mut x).unwrap();
    y.grad.write(&upstream_5()).unwrap();
    let out = y.data.to_vec().unwrap();
    layer.backward(&mut y, &mut x).unwrap();

    // ELU derivative by hand: 1 above zero, y + alpha below
    let gy: Vec<Real> = upstream_5()
        .iter()
        .zip(&out)
        .map(|(&g, &o)| if !elu || o >= 0.0 { g } else { g * (o + 1.0) })
        .collect();
    let (gw, gx) = matrix_reference(&weights_5x5(), &input_5(), &gy);

    assert_close(&layer.weight().grad.to_vec().unwrap(), &gw);
    assert_close(&layer.bias().unwrap().grad.to_vec().unwrap(), &gy);
    assert_close(&x.grad.to_vec().unwrap(), &gx);
}

#[test]
fn test_5x5_host_gradients_match_matrix_products() {
    let session = Session::disabled();
    check_5x5_gradients(&session, false, false);
    check_5x5_gradients(&session, false, true);
}

#[test]
fn test_5x5_device_gradients_match_matrix_products() {
    let Some(session) = device_session() else {
        eprintln!("no compute device; skipping");
        return;
    };
    check_5x5_gradients(&session, true, false);
    check_5x5_gradients(&session, true, true);
}

#[test]
fn test_host_forward_accumulates_onto_bias_in_order() {
    let (inp, out, batch) = (16, 64, 4);
    let weights: Vec<Real> = (0..out * inp)
        .map(|k| ((k * 37 % 101) as Real - 50.0) * 0.013)
        .collect();
    let bias: Vec<Real> = (0..out).map(|i| 1000.0 + i as Real * 0.37).collect();
    let input: Vec<Real> = (0..batch * inp)
        .map(|k| ((k * 53 % 97) as Real - 48.0) * 0.021)
        .collect();

    let session = Session::disabled();
    let mut layer = Linear::new(
        &session,
        LinearConfig::new(inp, out).weight(weights.clone()).bias(bias.clone()),
    )
    .unwrap();
    let mut x = Tensor::batched(input.clone(), [inp], batch).unwrap();
    let y = layer.forward(&mut x).unwrap().data.to_vec().unwrap();

    for b in 0..batch {
        for i in 0..out {
            let mut acc = bias[i];
            for j in 0..inp {
                acc += input[b * inp + j] * weights[i * inp + j];
            }
            assert_eq!(
                y[b * out + i].to_bits(),
                acc.to_bits(),
                "sample {b} output {i}: {} vs {acc}",
                y[b * out + i]
            );
        }
    }
}
