use anyhow::Result;
use milopt::block;
use milopt_ref_cpu::{evaluate, EvalError, HostTensor};

fn iota(dims: &[usize]) -> Result<HostTensor> {
    let count = dims.iter().product::<usize>();
    Ok(HostTensor::new(
        dims.to_vec(),
        (0..count).map(|v| v as f32).collect(),
    )?)
}

fn single(outputs: Vec<HostTensor>) -> HostTensor {
    assert_eq!(outputs.len(), 1, "expected one output");
    outputs.into_iter().next().expect("one output")
}

#[test]
fn transpose_moves_elements() -> Result<()> {
    let block = block!(
        r#"
func @t(%x: tensor<f32, 2x3>) {
  %y = transpose %x perm[1, 0]
  return %y
}
"#
    );
    let out = single(evaluate(&block, &[iota(&[2, 3])?])?);
    assert_eq!(out.dims(), [3, 2]);
    assert_eq!(out.data(), [0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    Ok(())
}

#[test]
fn binary_ops_broadcast_constants() -> Result<()> {
    let block = block!(
        r#"
func @b(%x: tensor<f32, 2x3>) {
  %c = const value[10, 20, 30] -> tensor<f32, 3>
  %s = add %x, %c
  %k = const value[2] -> tensor<f32>
  %y = mul %k, %s
  return %y
}
"#
    );
    let out = single(evaluate(&block, &[iota(&[2, 3])?])?);
    assert_eq!(out.data(), [20.0, 42.0, 64.0, 26.0, 48.0, 70.0]);
    Ok(())
}

#[test]
fn reductions_respect_keep_dims() -> Result<()> {
    let block = block!(
        r#"
func @r(%x: tensor<f32, 2x3>) {
  %s = reduce_sum %x axes[1]
  %m = reduce_max %x axes[0] keep_dims[true]
  %a = reduce_mean %x axes[]
  return %s, %m, %a
}
"#
    );
    let outs = evaluate(&block, &[iota(&[2, 3])?])?;
    assert_eq!(outs[0].dims(), [2]);
    assert_eq!(outs[0].data(), [3.0, 12.0]);
    assert_eq!(outs[1].dims(), [1, 3]);
    assert_eq!(outs[1].data(), [3.0, 4.0, 5.0]);
    assert!(outs[2].dims().is_empty());
    assert_eq!(outs[2].data(), [2.5]);
    Ok(())
}

#[test]
fn concat_interleaves_along_inner_axes() -> Result<()> {
    let block = block!(
        r#"
func @c(%x: tensor<f32, 2x2>) {
  %y = concat %x, %x axis[1]
  return %y
}
"#
    );
    let out = single(evaluate(&block, &[iota(&[2, 2])?])?);
    assert_eq!(out.dims(), [2, 4]);
    assert_eq!(out.data(), [0.0, 1.0, 0.0, 1.0, 2.0, 3.0, 2.0, 3.0]);
    Ok(())
}

#[test]
fn pad_modes() -> Result<()> {
    let block = block!(
        r#"
func @p(%x: tensor<f32, 1x3>) {
  %c = pad %x pad[1, 1] constant_val[9]
  %r = pad %x pad[1, 1] mode[reflect]
  %e = pad %x pad[1, 1] mode[replicate]
  return %c, %r, %e
}
"#
    );
    let input = HostTensor::new(vec![1, 3], vec![1.0, 2.0, 3.0])?;
    let outs = evaluate(&block, &[input])?;
    assert_eq!(outs[0].data(), [9.0, 1.0, 2.0, 3.0, 9.0]);
    assert_eq!(outs[1].data(), [2.0, 1.0, 2.0, 3.0, 2.0]);
    assert_eq!(outs[2].data(), [1.0, 1.0, 2.0, 3.0, 3.0]);
    Ok(())
}

#[test]
fn pooling_windows() -> Result<()> {
    let block = block!(
        r#"
func @pool(%x: tensor<f32, 1x1x2x2>) {
  %a = avg_pool %x kernel[2, 2]
  %m = max_pool %x kernel[2, 2]
  %l = l2_pool %x kernel[1, 2]
  return %a, %m, %l
}
"#
    );
    let input = HostTensor::new(vec![1, 1, 2, 2], vec![1.0, 2.0, 3.0, 4.0])?;
    let outs = evaluate(&block, &[input])?;
    assert_eq!(outs[0].data(), [2.5]);
    assert_eq!(outs[1].data(), [4.0]);
    assert_eq!(outs[2].dims(), [1, 1, 2, 1]);
    assert!((outs[2].data()[0] - 5.0f32.sqrt()).abs() < 1e-6);
    assert!((outs[2].data()[1] - 5.0).abs() < 1e-6);
    Ok(())
}

#[test]
fn unary_functions() -> Result<()> {
    let block = block!(
        r#"
func @u(%x: tensor<f32, 3>) {
  %r = relu %x
  %s = sigmoid %x
  %g = gelu %x
  return %r, %s, %g
}
"#
    );
    let input = HostTensor::new(vec![3], vec![-1.0, 0.0, 2.0])?;
    let outs = evaluate(&block, &[input])?;
    assert_eq!(outs[0].data(), [0.0, 0.0, 2.0]);
    assert!((outs[1].data()[1] - 0.5).abs() < 1e-6);
    assert!((outs[2].data()[2] - 1.954_5).abs() < 1e-3);
    Ok(())
}

#[test]
fn parameterized_activations() -> Result<()> {
    let block = block!(
        r#"
func @act(%x: tensor<f32, 3>) {
  %c = clip %x alpha[-0.5] beta[1]
  %l = leaky_relu %x alpha[0.1]
  %a = linear_activation %x alpha[2] beta[1]
  %t = thresholded_relu %x alpha[1]
  return %c, %l, %a, %t
}
"#
    );
    let input = HostTensor::new(vec![3], vec![-1.0, 0.0, 2.0])?;
    let outs = evaluate(&block, &[input])?;
    assert_eq!(outs[0].data(), [-0.5, 0.0, 1.0]);
    assert!((outs[1].data()[0] + 0.1).abs() < 1e-6);
    assert_eq!(outs[2].data(), [-1.0, 1.0, 5.0]);
    assert_eq!(outs[3].data(), [0.0, 0.0, 2.0]);
    Ok(())
}

#[test]
fn rejects_custom_ops_and_bad_inputs() -> Result<()> {
    let block = block!(
        r#"
func @opaque(%x: tensor<f32, 2>) {
  %y = custom<mystery> %x -> tensor<f32, 2>
  return %y
}
"#
    );
    let input = iota(&[2])?;
    assert!(matches!(
        evaluate(&block, &[input.clone()]),
        Err(EvalError::Unsupported { .. })
    ));
    assert!(matches!(
        evaluate(&block, &[]),
        Err(EvalError::Execution(_))
    ));
    assert!(matches!(
        evaluate(&block, &[iota(&[3])?]),
        Err(EvalError::Execution(_))
    ));
    assert!(HostTensor::new(vec![2, 2], vec![0.0; 3]).is_err());
    assert_eq!(input.max_abs_diff(&iota(&[1, 2])?), None);
    Ok(())
}
