pub mod env;
pub mod telemetry;

use std::hint::black_box;

/// Performs `&str` comparisons in constant time so that token and signature checks don't leak
/// how many leading bytes matched
pub fn constant_time_cmp(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let diff = a
        .as_bytes()
        .iter()
        .zip(b.as_bytes())
        .fold(0u8, |acc, (l, r)| acc | black_box(l ^ r));

    black_box(diff) == 0
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_const_time_cmp() {
        let expects = "internal_token";

        assert!(constant_time_cmp(expects, "internal_token"));
        assert!(!constant_time_cmp(expects, "__ternal_token"));
        assert!(!constant_time_cmp(expects, "internal_tok__"));
        assert!(!constant_time_cmp(expects, "internal_toke"));
        assert!(!constant_time_cmp(expects, "internal_token_"));
        assert!(constant_time_cmp("", ""));
    }
}
