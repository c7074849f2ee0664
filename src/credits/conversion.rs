//! Token to credit conversion

/// Tokens covered by one credit
pub const TOKENS_PER_CREDIT: u64 = 1000;

/// Estimate used when the caller does not provide one (one credit)
pub const DEFAULT_ESTIMATED_TOKENS: u64 = 1000;

/// Convert a token count into credits, rounding up.
///
/// Any started block of [`TOKENS_PER_CREDIT`] tokens costs a full credit, so an
/// estimate never comes out below the real cost.
pub fn tokens_to_credits(tokens: u64) -> u64 {
    tokens.div_ceil(TOKENS_PER_CREDIT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_tokens_cost_nothing() {
        assert_eq!(tokens_to_credits(0), 0);
    }

    #[test]
    fn test_rounds_up() {
        assert_eq!(tokens_to_credits(1), 1);
        assert_eq!(tokens_to_credits(999), 1);
        assert_eq!(tokens_to_credits(1000), 1);
        assert_eq!(tokens_to_credits(1001), 2);
        assert_eq!(tokens_to_credits(2500), 3);
    }

    #[test]
    fn test_default_estimate_is_one_credit() {
        assert_eq!(tokens_to_credits(DEFAULT_ESTIMATED_TOKENS), 1);
    }

    #[test]
    fn test_no_overflow_at_max() {
        assert_eq!(tokens_to_credits(u64::MAX), u64::MAX / TOKENS_PER_CREDIT + 1);
    }
}
