use anyhow::Result;
use milopt::ir::builder::BlockBuilder;
use milopt::ir::spec::{BinaryOp, Block, DType, OpKind, Shape, TensorLiteral, TensorType};
use milopt::ir::text::parse_block;
use milopt::ir::verify::verify_block;
use milopt::passes::reduce_transposes;
use milopt::passes::{BlockPass, ReduceTransposesPass};

fn optimize(src: &str) -> Result<(Block, bool)> {
    let mut block = parse_block(src)?;
    let before = block.output_types();
    let changed = reduce_transposes::apply(&mut block)?;
    verify_block(&block)?;
    assert_eq!(block.output_types(), before, "output types must survive");
    Ok((block, changed))
}

fn ops(block: &Block) -> Vec<String> {
    block.op_types_in_program()
}

fn output_dims(block: &Block) -> Vec<Vec<usize>> {
    block
        .output_types()
        .into_iter()
        .map(|ty| {
            ty.and_then(|ty| ty.shape.static_dims())
                .expect("static output type")
        })
        .collect()
}

#[test]
fn consecutive_transposes_cancel() -> Result<()> {
    let (block, changed) = optimize(
        r#"
        func @main(%x: tensor<f32, 10x20>) {
          %t1 = transpose %x perm[1, 0]
          %t2 = transpose %t1 perm[1, 0]
          %y = relu %t2
          return %y
        }
        "#,
    )?;
    assert!(changed);
    assert_eq!(ops(&block), ["relu"]);
    assert_eq!(output_dims(&block), [vec![10, 20]]);
    Ok(())
}

#[test]
fn transpose_pair_around_unary_chain_is_removed() -> Result<()> {
    let (block, changed) = optimize(
        r#"
        func @main(%x: tensor<f32, 1x2x3x4>) {
          %t = transpose %x perm[0, 2, 3, 1]
          %a = relu %t
          %b = identity %a
          %c = relu %b
          %y = transpose %c perm[0, 3, 1, 2]
          return %y
        }
        "#,
    )?;
    assert!(changed);
    assert_eq!(ops(&block), ["relu", "identity", "relu"]);
    assert_eq!(output_dims(&block), [vec![1, 2, 3, 4]]);
    Ok(())
}

#[test]
fn returned_cancel_gives_its_name_to_the_producer() -> Result<()> {
    let (block, _) = optimize(
        r#"
        func @main(%x: tensor<f32, 10x2x3>) {
          %t = transpose %x perm[0, 2, 1]
          %r = relu %t
          %y = transpose %r perm[0, 2, 1]
          return %y
        }
        "#,
    )?;
    assert_eq!(ops(&block), ["relu"]);
    let relu = &block.find_ops("relu")[0];
    assert_eq!(block.name_of(relu.outputs[0]), Some("y"));
    assert_eq!(output_dims(&block), [vec![10, 2, 3]]);
    Ok(())
}

#[test]
fn intermediate_block_output_is_materialized() -> Result<()> {
    let (block, changed) = optimize(
        r#"
        func @main(%x: tensor<f32, 1x2x3x4>) {
          %t = transpose %x perm[0, 2, 3, 1]
          %x1 = relu %t
          %x2 = log %x1
          %x3 = relu %x2
          %x4 = transpose %x3 perm[0, 3, 1, 2]
          return %x4, %x1
        }
        "#,
    )?;
    assert!(changed);
    assert_eq!(ops(&block), ["relu", "log", "relu", "transpose"]);
    assert_eq!(output_dims(&block), [vec![1, 2, 3, 4], vec![1, 3, 4, 2]]);
    let names: Vec<_> = block
        .outputs
        .iter()
        .map(|value| block.name_of(*value))
        .collect();
    assert_eq!(names, [Some("x4"), Some("x1")]);
    Ok(())
}

#[test]
fn independent_regions_are_all_rewritten() -> Result<()> {
    let src = r#"
        func @main(%x: tensor<f32, 10x2x3x5>) {
          %t1 = transpose %x perm[0, 2, 3, 1]
          %r1 = relu %t1
          %t2 = transpose %r1 perm[0, 3, 1, 2]
          %r2 = relu %t2
          %t3 = transpose %r2 perm[0, 2, 3, 1]
          %l = log %t3
          %t4 = transpose %l perm[0, 3, 1, 2]
          return %t4
        }
    "#;
    let mut block = parse_block(src)?;
    let result = ReduceTransposesPass::default().run(&mut block)?;
    assert!(result.changed);
    assert_eq!(result.rewrites_applied, 2);
    assert_eq!(result.erased_ops, 4);
    assert_eq!(ops(&block), ["relu", "relu", "log"]);
    let log = &block.find_ops("log")[0];
    assert_eq!(block.outputs, log.outputs);
    Ok(())
}

#[test]
fn fanout_keeps_transpose_in_front_of_pool() -> Result<()> {
    let (block, changed) = optimize(
        r#"
        func @main(%x: tensor<f32, 10x2x3x5>) {
          %t = transpose %x perm[0, 2, 3, 1]
          %a = relu %t
          %b = relu %t
          %ya = transpose %a perm[0, 3, 1, 2]
          return %ya, %b
        }
        "#,
    )?;
    assert!(changed);
    assert_eq!(ops(&block), ["relu", "relu", "transpose"]);
    assert_eq!(output_dims(&block), [vec![10, 2, 3, 5], vec![10, 3, 5, 2]]);
    Ok(())
}

#[test]
fn region_that_needs_more_transposes_is_left_alone() -> Result<()> {
    let src = r#"
        func @main(%x: tensor<f32, 10x2x3x5>) {
          %t = transpose %x perm[0, 2, 3, 1]
          %a = relu %t
          %p = avg_pool %a kernel[1, 1]
          %q = max_pool %a kernel[1, 1]
          return %p, %q
        }
    "#;
    let (block, changed) = optimize(src)?;
    assert!(!changed);
    assert_eq!(block.to_text(), parse_block(src)?.to_text());

    let (block, changed) = optimize(
        r#"
        func @main(%x: tensor<f32, 10x2x3x5>) {
          %t = transpose %x perm[0, 2, 3, 1]
          %a = relu %t
          %b = relu %t
          return %a, %b
        }
        "#,
    )?;
    assert!(!changed);
    assert_eq!(ops(&block), ["transpose", "relu", "relu"]);
    Ok(())
}

#[test]
fn returned_transpose_is_not_a_seed() -> Result<()> {
    let (block, changed) = optimize(
        r#"
        func @main(%x: tensor<f32, 2x3>) {
          %t = transpose %x perm[1, 0]
          return %t
        }
        "#,
    )?;
    assert!(!changed);
    assert_eq!(ops(&block), ["transpose"]);
    Ok(())
}

#[test]
fn non_cancelling_transpose_is_a_boundary() -> Result<()> {
    let (block, changed) = optimize(
        r#"
        func @main(%x: tensor<f32, 1x2x3x4>) {
          %t = transpose %x perm[0, 2, 3, 1]
          %r = relu %t
          %u = transpose %r perm[0, 2, 3, 1]
          %y = log %u
          return %y
        }
        "#,
    )?;
    assert!(!changed);
    assert_eq!(ops(&block), ["transpose", "relu", "transpose", "log"]);
    Ok(())
}

#[test]
fn custom_op_blocks_propagation() -> Result<()> {
    let (block, changed) = optimize(
        r#"
        func @main(%x: tensor<f32, 1x2x3x4>) {
          %t = transpose %x perm[0, 2, 3, 1]
          %c = custom<opaque> %t -> tensor<f32, 1x3x4x2>
          %y = transpose %c perm[0, 3, 1, 2]
          return %y
        }
        "#,
    )?;
    assert!(!changed);
    assert_eq!(ops(&block), ["transpose", "opaque", "transpose"]);
    Ok(())
}

#[test]
fn reduce_with_keep_dims_moves_its_axes() -> Result<()> {
    let (block, changed) = optimize(
        r#"
        func @main(%x: tensor<f32, 10x2x3>) {
          %t = transpose %x perm[0, 2, 1]
          %a = relu %t
          %m = reduce_mean %t axes[2] keep_dims[true]
          %y1 = transpose %a perm[0, 2, 1]
          %l = log %m
          %y2 = transpose %l perm[0, 2, 1]
          return %y1, %y2
        }
        "#,
    )?;
    assert!(changed);
    assert_eq!(ops(&block), ["relu", "reduce_mean", "log"]);
    match &block.find_ops("reduce_mean")[0].kind {
        OpKind::Reduce(spec) => {
            assert_eq!(spec.axes, [1]);
            assert!(spec.keep_dims);
        }
        other => panic!("unexpected kind {other:?}"),
    }
    assert_eq!(output_dims(&block), [vec![10, 2, 3], vec![10, 1, 3]]);
    Ok(())
}

#[test]
fn rank_dropping_reduce_ends_the_region() -> Result<()> {
    let (block, changed) = optimize(
        r#"
        func @main(%x: tensor<f32, 2x3x4>) {
          %t = transpose %x perm[0, 2, 1]
          %m = reduce_mean %t axes[1] keep_dims[false]
          %y = log %m
          return %y
        }
        "#,
    )?;
    assert!(changed);
    assert_eq!(ops(&block), ["reduce_mean", "log"]);
    match &block.find_ops("reduce_mean")[0].kind {
        OpKind::Reduce(spec) => assert_eq!(spec.axes, [2]),
        other => panic!("unexpected kind {other:?}"),
    }
    assert_eq!(output_dims(&block), [vec![2, 3]]);
    Ok(())
}

#[test]
fn constant_pad_rows_follow_the_permutation() -> Result<()> {
    let (block, changed) = optimize(
        r#"
        func @main(%x: tensor<f32, 11x2x3x6>) {
          %t = transpose %x perm[0, 3, 1, 2]
          %p = pad %t pad[0, 0, 0, 0, 1, 2, 3, 4] mode[constant] constant_val[3]
          %l = log %p
          %y = transpose %l perm[0, 2, 3, 1]
          return %y
        }
        "#,
    )?;
    assert!(changed);
    assert_eq!(ops(&block), ["pad", "log"]);
    match &block.find_ops("pad")[0].kind {
        OpKind::Pad(spec) => {
            assert_eq!(spec.pad, [0, 0, 1, 2, 3, 4, 0, 0]);
            assert_eq!(spec.constant_val, 3.0);
        }
        other => panic!("unexpected kind {other:?}"),
    }
    Ok(())
}

#[test]
fn reflect_pad_only_moves_within_the_last_two_axes() -> Result<()> {
    let (block, changed) = optimize(
        r#"
        func @main(%x: tensor<f32, 11x2x3x6>) {
          %t = transpose %x perm[0, 1, 3, 2]
          %p = pad %t pad[0, 0, 0, 0, 1, 2, 3, 4] mode[reflect]
          %l = log %p
          %y = transpose %l perm[0, 1, 3, 2]
          return %y
        }
        "#,
    )?;
    assert!(changed);
    assert_eq!(ops(&block), ["pad", "log"]);
    match &block.find_ops("pad")[0].kind {
        OpKind::Pad(spec) => assert_eq!(spec.pad, [0, 0, 0, 0, 3, 4, 1, 2]),
        other => panic!("unexpected kind {other:?}"),
    }

    let (block, changed) = optimize(
        r#"
        func @main(%x: tensor<f32, 11x2x3x6>) {
          %t = transpose %x perm[0, 3, 1, 2]
          %p = pad %t pad[0, 0, 0, 0, 1, 2, 3, 4] mode[reflect]
          %l = log %p
          %y = transpose %l perm[0, 2, 3, 1]
          return %y
        }
        "#,
    )?;
    assert!(!changed);
    assert_eq!(ops(&block), ["transpose", "pad", "log", "transpose"]);
    Ok(())
}

#[test]
fn vector_constant_is_reshaped_onto_the_channel_axis() -> Result<()> {
    let (block, changed) = optimize(
        r#"
        func @main(%x: tensor<f32, 1x2x5x5>) {
          %c = const value[10, 100] -> tensor<f32, 2>
          %t = transpose %x perm[0, 2, 3, 1]
          %s = add %t, %c
          %y = transpose %s perm[0, 3, 1, 2]
          return %y
        }
        "#,
    )?;
    assert!(changed);
    assert_eq!(ops(&block), ["add"]);
    let consts = block.find_ops("const");
    assert_eq!(consts.len(), 1);
    let literal = consts[0].kind.as_const().expect("const literal");
    assert_eq!(literal.ty.shape.static_dims(), Some(vec![1, 2, 1, 1]));
    assert_eq!(literal.to_f64_vec(), Some(vec![10.0, 100.0]));
    Ok(())
}

#[test]
fn scalar_operand_is_untouched() -> Result<()> {
    let (block, changed) = optimize(
        r#"
        func @main(%x: tensor<f32, 1x2x5x5>) {
          %c = const value[5] -> tensor<f32>
          %t = transpose %x perm[0, 2, 3, 1]
          %s = add %c, %t
          %y = transpose %s perm[0, 3, 1, 2]
          return %y
        }
        "#,
    )?;
    assert!(changed);
    assert_eq!(ops(&block), ["add"]);
    let literal = block.find_ops("const")[0]
        .kind
        .as_const()
        .expect("const literal")
        .clone();
    assert_eq!(literal.ty.rank(), 0);
    Ok(())
}

#[test]
fn broadcast_between_two_regions_merges_them() -> Result<()> {
    let (block, changed) = optimize(
        r#"
        func @main(%x: tensor<f32, 1x2x5x5>, %w: tensor<f32, 1x2x1x1>) {
          %t1 = transpose %x perm[0, 2, 3, 1]
          %t2 = transpose %w perm[0, 2, 3, 1]
          %r = relu %t1
          %s = add %r, %t2
          %y = transpose %s perm[0, 3, 1, 2]
          return %y
        }
        "#,
    )?;
    assert!(changed);
    assert_eq!(ops(&block), ["relu", "add"]);
    assert_eq!(output_dims(&block), [vec![1, 2, 5, 5]]);
    Ok(())
}

#[test]
fn same_transpose_on_both_operands() -> Result<()> {
    let (block, changed) = optimize(
        r#"
        func @main(%x: tensor<f32, 1x2x5x5>) {
          %t = transpose %x perm[0, 2, 3, 1]
          %s = add %t, %t
          %y = transpose %s perm[0, 3, 1, 2]
          return %y
        }
        "#,
    )?;
    assert!(changed);
    assert_eq!(ops(&block), ["add"]);
    let add = &block.find_ops("add")[0];
    assert_eq!(add.inputs, [block.inputs[0], block.inputs[0]]);
    Ok(())
}

#[test]
fn concat_axis_follows_the_permutation() -> Result<()> {
    let (block, changed) = optimize(
        r#"
        func @main(%x: tensor<f32, 1x2x5x5>, %y: tensor<f32, 1x3x5x5>) {
          %t1 = transpose %x perm[0, 2, 3, 1]
          %t2 = transpose %y perm[0, 2, 3, 1]
          %a = relu %t1
          %b = relu %t2
          %c = concat %a, %b axis[3]
          %out = transpose %c perm[0, 3, 1, 2]
          return %out
        }
        "#,
    )?;
    assert!(changed);
    assert_eq!(ops(&block), ["relu", "relu", "concat"]);
    match &block.find_ops("concat")[0].kind {
        OpKind::Concat(spec) => assert_eq!(spec.axis, 1),
        other => panic!("unexpected kind {other:?}"),
    }
    assert_eq!(output_dims(&block), [vec![1, 5, 5, 5]]);
    Ok(())
}

#[test]
fn concat_with_full_rank_constant() -> Result<()> {
    let (block, changed) = optimize(
        r#"
        func @main(%x: tensor<f32, 10x2x30>) {
          %c = const value[1] -> tensor<f32, 10x30x5>
          %t = transpose %x perm[0, 2, 1]
          %j = concat %t, %c axis[2]
          %y = transpose %j perm[0, 2, 1]
          return %y
        }
        "#,
    )?;
    assert!(changed);
    assert_eq!(ops(&block), ["concat"]);
    let literal = block.find_ops("const")[0]
        .kind
        .as_const()
        .expect("const literal")
        .clone();
    assert_eq!(literal.ty.shape.static_dims(), Some(vec![10, 5, 30]));
    assert_eq!(output_dims(&block), [vec![10, 7, 30]]);
    Ok(())
}

#[test]
fn concat_with_runtime_operand_is_a_boundary() -> Result<()> {
    let (block, changed) = optimize(
        r#"
        func @main(%x: tensor<f32, 1x2x5x5>, %z: tensor<f32, 1x5x5x3>) {
          %t = transpose %x perm[0, 2, 3, 1]
          %c = concat %t, %z axis[3]
          %y = relu %c
          return %y
        }
        "#,
    )?;
    assert!(!changed);
    assert_eq!(ops(&block), ["transpose", "concat", "relu"]);
    Ok(())
}

const SKIP_CONNECTION: &str = r#"
    func @main(%x: tensor<f32, 1x5x5x3>) {
      %t0 = transpose %x perm[0, 3, 1, 2]
      %xr = relu %t0
      %x1 = transpose %xr perm[0, 2, 3, 1]
      %x2 = relu %x1
      %x3 = transpose %x2 perm[0, 3, 1, 2]
      %s = add %xr, %x3
      %x5 = relu %s
      %p = avg_pool %x5 kernel[1, 1]
      return %p
    }
"#;

#[test]
fn skip_connection_keeps_one_transpose_before_pool() -> Result<()> {
    let (block, changed) = optimize(SKIP_CONNECTION)?;
    assert!(changed);
    assert_eq!(
        ops(&block),
        ["relu", "relu", "add", "relu", "transpose", "avg_pool"]
    );
    Ok(())
}

#[test]
fn skip_connection_back_in_source_layout() -> Result<()> {
    let (block, changed) = optimize(
        r#"
        func @main(%x: tensor<f32, 1x5x5x3>) {
          %t0 = transpose %x perm[0, 3, 1, 2]
          %xr = relu %t0
          %x1 = transpose %xr perm[0, 2, 3, 1]
          %x2 = relu %x1
          %x3 = transpose %x2 perm[0, 3, 1, 2]
          %s = add %xr, %x3
          %x5 = relu %s
          %x6 = transpose %x5 perm[0, 2, 3, 1]
          %p = avg_pool %x6 kernel[1, 1]
          return %p
        }
        "#,
    )?;
    assert!(changed);
    assert_eq!(ops(&block), ["relu", "relu", "add", "relu", "avg_pool"]);
    Ok(())
}

#[test]
fn residual_output_is_transposed_back() -> Result<()> {
    let (block, changed) = optimize(
        r#"
        func @main(%x: tensor<f32, 2x5>) {
          %x1 = transpose %x perm[1, 0]
          %t1 = transpose %x1 perm[1, 0]
          %x2 = reduce_mean %t1 axes[1] keep_dims[true]
          %t2 = transpose %x2 perm[1, 0]
          %s = add %x1, %t2
          return %s
        }
        "#,
    )?;
    assert!(changed);
    assert_eq!(ops(&block), ["reduce_mean", "add", "transpose"]);
    let last = block.operations.last().expect("non-empty block");
    assert_eq!(block.name_of(last.outputs[0]), Some("s"));
    assert_eq!(output_dims(&block), [vec![5, 2]]);
    Ok(())
}

#[test]
fn residual_with_two_outputs() -> Result<()> {
    let (block, changed) = optimize(
        r#"
        func @main(%x: tensor<f32, 2x5>) {
          %x1 = transpose %x perm[1, 0]
          %t1 = transpose %x1 perm[1, 0]
          %x2 = reduce_mean %t1 axes[1] keep_dims[true]
          %t2 = transpose %x2 perm[1, 0]
          %s = add %x1, %t2
          %r = relu %s
          return %s, %r
        }
        "#,
    )?;
    assert!(changed);
    assert_eq!(
        ops(&block),
        ["reduce_mean", "add", "relu", "transpose", "transpose"]
    );
    assert_eq!(output_dims(&block), [vec![5, 2], vec![5, 2]]);
    Ok(())
}

#[test]
fn value_returned_twice_through_cancels() -> Result<()> {
    let (block, changed) = optimize(
        r#"
        func @main(%x: tensor<f32, 1x2x5x5>) {
          %t = transpose %x perm[0, 2, 3, 1]
          %r = relu %t
          %s = add %t, %r
          %y1 = transpose %s perm[0, 3, 1, 2]
          %y2 = transpose %s perm[0, 3, 1, 2]
          return %y1, %y2
        }
        "#,
    )?;
    assert!(changed);
    assert_eq!(ops(&block), ["relu", "add", "identity"]);
    Ok(())
}

#[test]
fn second_run_is_a_no_op() -> Result<()> {
    let mut block = parse_block(SKIP_CONNECTION)?;
    assert!(reduce_transposes::apply(&mut block)?);
    let once = block.to_text();
    assert!(!reduce_transposes::apply(&mut block)?);
    assert_eq!(block.to_text(), once);
    Ok(())
}

#[test]
fn block_without_transposes_reports_one_round() -> Result<()> {
    let mut block = parse_block(
        r#"
        func @main(%x: tensor<f32, 4x4>) {
          %y = relu %x
          return %y
        }
        "#,
    )?;
    let result = ReduceTransposesPass::default().run(&mut block)?;
    assert!(!result.changed);
    assert_eq!(result.iterations, 1);
    assert_eq!(result.rewrites_applied, 0);
    Ok(())
}

#[test]
fn scalar_transpose_with_vector_constant_is_a_boundary() -> Result<()> {
    let mut builder = BlockBuilder::new("main");
    let x = builder.add_input("x", TensorType::new(DType::F32, Shape::scalar()))?;
    let t = builder.emit_named("t", OpKind::transpose(Vec::new()), &[x])?;
    let literal = TensorLiteral::from_f64_values(
        TensorType::new(DType::F32, Shape::from_static(&[2])),
        &[1.0, 2.0],
    )?;
    let c = builder.constant("c", literal)?;
    let s = builder.emit_named("s", OpKind::Binary(BinaryOp::Add), &[t, c])?;
    let mut block = builder.finish(&[s])?;
    let before = block.to_text();

    assert!(!reduce_transposes::apply(&mut block)?);
    assert_eq!(block.to_text(), before);
    Ok(())
}

#[test]
fn cancel_that_feeds_another_seed_is_spliced() -> Result<()> {
    let (block, changed) = optimize(
        r#"
        func @main(%x: tensor<f32, 2x2x2>) {
          %a = transpose %x perm[1, 0, 2]
          %b = transpose %a perm[1, 0, 2]
          %c = transpose %b perm[0, 2, 1]
          %m = mul %a, %c
          return %m
        }
        "#,
    )?;
    assert!(changed);
    assert_eq!(ops(&block), ["transpose", "transpose", "mul"]);
    let perms: Vec<Vec<usize>> = block
        .operations
        .iter()
        .filter_map(|op| op.kind.as_transpose().map(|spec| spec.perm.clone()))
        .collect();
    assert_eq!(perms, [vec![1, 0, 2], vec![0, 2, 1]]);
    for op in block.find_ops("transpose") {
        assert_eq!(block.value(op.inputs[0]).map(|v| v.name.as_str()), Some("x"));
    }
    Ok(())
}

#[test]
fn parameterized_activations_pass_the_permutation_through() -> Result<()> {
    let (block, changed) = optimize(
        r#"
        func @main(%x: tensor<f32, 1x2x3x4>) {
          %t = transpose %x perm[0, 2, 3, 1]
          %a = leaky_relu %t alpha[0.1]
          %b = clip %a alpha[-1] beta[6]
          %c = scaled_tanh %b alpha[2] beta[0.5]
          %y = transpose %c perm[0, 3, 1, 2]
          return %y
        }
        "#,
    )?;
    assert!(changed);
    assert_eq!(ops(&block), ["leaky_relu", "clip", "scaled_tanh"]);
    assert_eq!(output_dims(&block), [vec![1, 2, 3, 4]]);
    Ok(())
}
