use std::env;
use std::sync::OnceLock;

static MILOPT_DUMP_IR: OnceLock<bool> = OnceLock::new();
static MILOPT_REDUCE_TRANSPOSES_MAX_ROUNDS: OnceLock<Option<usize>> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

/// Logs block text before and after passes when set.
pub(crate) fn dump_ir_enabled() -> bool {
    *MILOPT_DUMP_IR.get_or_init(|| match env::var("MILOPT_DUMP_IR") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}

/// Overrides `ReduceTransposesConfig::max_rounds` when set to a positive integer.
pub(crate) fn reduce_transposes_max_rounds() -> Option<usize> {
    *MILOPT_REDUCE_TRANSPOSES_MAX_ROUNDS.get_or_init(|| {
        env::var("MILOPT_REDUCE_TRANSPOSES_MAX_ROUNDS")
            .ok()
            .and_then(|value| value.trim().parse::<usize>().ok())
            .filter(|rounds| *rounds > 0)
    })
}
