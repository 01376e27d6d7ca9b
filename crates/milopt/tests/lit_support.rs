use std::fs;
use std::path::PathBuf;

use milopt::ir::text::parse_block;
use milopt::ir::verify::verify_block;
use milopt::BlockPass;

pub struct Case {
    pub name: String,
    pub meta: String,
    pub input: String,
    pub expected: String,
}

impl Case {
    /// `META: unchanged` marks cases where the passes must leave the block alone.
    fn expects_change(&self) -> bool {
        !self.meta.lines().any(|line| line.trim() == "unchanged")
    }
}

/// Fixture format:
/// META:
/// <free-form flags, optional>
/// EXPECTED:
/// <block text>
/// INPUT:
/// <block text>
/// run_test
/// (repeat)
pub fn load_cases(fixture_rel: &str) -> Vec<Case> {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(fixture_rel);
    let contents =
        fs::read_to_string(&path).unwrap_or_else(|e| panic!("cannot read {:?}: {}", path, e));
    let mut cases = Vec::new();
    let mut meta = String::new();
    let mut expected = String::new();
    let mut input = String::new();
    let mut section: Option<&str> = None;
    let mut counter = 0;
    for line in contents.lines() {
        match line.trim_end() {
            "META:" => {
                section = Some("meta");
                meta.clear();
            }
            "EXPECTED:" => {
                section = Some("expected");
                expected.clear();
            }
            "INPUT:" => {
                section = Some("input");
                input.clear();
            }
            "run_test" => {
                counter += 1;
                cases.push(Case {
                    name: format!("case_{counter}"),
                    meta: meta.clone(),
                    input: input.clone(),
                    expected: expected.clone(),
                });
                meta.clear();
                section = None;
            }
            other => {
                let target = match section {
                    Some("meta") => &mut meta,
                    Some("expected") => &mut expected,
                    Some("input") => &mut input,
                    _ => continue,
                };
                target.push_str(other);
                target.push('\n');
            }
        }
    }
    cases
}

pub fn run_case_with_passes(passes: &[&dyn BlockPass], case: &Case) {
    let mut block = parse_block(&case.input)
        .unwrap_or_else(|e| panic!("cannot parse input of {}: {}", case.name, e));

    let mut changed = false;
    for pass in passes {
        let res = pass
            .run(&mut block)
            .unwrap_or_else(|e| panic!("pass {} failed on {}: {}", pass.name(), case.name, e));
        changed |= res.changed;
    }

    assert_eq!(
        changed,
        case.expects_change(),
        "unexpected change status for {}",
        case.name
    );
    assert!(
        verify_block(&block).is_ok(),
        "verification failed for {}",
        case.name
    );
    let out = block.to_text();
    assert_eq!(
        out.trim(),
        case.expected.trim(),
        "output mismatch for {}",
        case.name
    );
}
