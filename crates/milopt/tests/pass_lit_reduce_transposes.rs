mod lit_support;

use lit_support::{load_cases, run_case_with_passes};
use milopt::passes::ReduceTransposesPass;

#[test]
fn reduce_transposes_cases() {
    let cases = load_cases("reduce_transposes.lit");
    assert!(!cases.is_empty(), "fixture must contain cases");
    let pass = ReduceTransposesPass::default();
    for case in cases {
        run_case_with_passes(&[&pass], &case);
    }
}
