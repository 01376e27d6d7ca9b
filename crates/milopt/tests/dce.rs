mod lit_support;

use milopt::block;
use milopt::ir::verify::verify_block;
use milopt::passes::{BlockPass, DeadCodeEliminationPass, ReduceTransposesPass};

#[test]
fn removes_unused_chains_and_their_values() {
    let mut block = block!(
        r#"
func @dead(%x: tensor<f32, 2x3>) {
  %c = const value[1] -> tensor<f32, 2x3>
  %a = relu %x
  %unused = add %a, %c
  %gone = log %unused
  %y = exp %a
  return %y
}
"#
    );
    let result = DeadCodeEliminationPass.run(&mut block).expect("dce runs");
    assert!(result.changed);
    assert_eq!(result.erased_ops, 3);
    assert_eq!(block.op_types_in_program(), ["relu", "exp"]);
    assert!(block.value_by_name("gone").is_none());
    assert_eq!(block.values.len(), 3);
    verify_block(&block).expect("block stays well formed");
}

#[test]
fn keeps_custom_ops_and_what_they_read() {
    let mut block = block!(
        r#"
func @effects(%x: tensor<f32, 4>) {
  %a = relu %x
  %s = custom<sink> %a -> tensor<f32, 4>
  return %x
}
"#
    );
    let result = DeadCodeEliminationPass.run(&mut block).expect("dce runs");
    assert!(!result.changed);
    assert_eq!(block.op_types_in_program(), ["relu", "sink"]);
}

#[test]
fn cleans_up_after_transpose_reduction() {
    let cases = lit_support::load_cases("reduce_transposes.lit");
    let reduce = ReduceTransposesPass::default();
    for case in cases.iter().filter(|case| !case.meta.contains("unchanged")) {
        lit_support::run_case_with_passes(&[&reduce, &DeadCodeEliminationPass], case);
    }
}
