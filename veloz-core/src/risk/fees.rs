//! Trading fee policy: a pluggable trait so the maker/taker split can be
//! swapped without touching Engine State's fill-application code.

use rust_decimal::Decimal;

/// Computes the fee owed on one fill's notional value.
pub trait FeePolicy: Send + Sync {
    fn fee(&self, notional: Decimal, is_maker: bool) -> Decimal;
}

/// Flat basis-points fee, charged in the quote asset against fill notional,
/// with a separate rate for liquidity-adding (maker) and liquidity-taking
/// (taker) fills — the same maker/taker split most venues quote.
#[derive(Debug, Clone, Copy)]
pub struct BasisPointsFeePolicy {
    pub maker_bps: Decimal,
    pub taker_bps: Decimal,
}

impl FeePolicy for BasisPointsFeePolicy {
    fn fee(&self, notional: Decimal, is_maker: bool) -> Decimal {
        let bps = if is_maker { self.maker_bps } else { self.taker_bps };
        notional * bps / Decimal::new(10_000, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn maker_and_taker_rates_apply_independently() {
        let policy = BasisPointsFeePolicy {
            maker_bps: dec!(1),
            taker_bps: dec!(5),
        };
        assert_eq!(policy.fee(dec!(10000), true), dec!(1));
        assert_eq!(policy.fee(dec!(10000), false), dec!(5));
    }
}
