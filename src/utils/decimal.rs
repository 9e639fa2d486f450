//! Decimal arithmetic utilities for financial calculations.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Round to tick size (e.g., 0.01 for most quote prices).
pub fn round_to_tick(value: Decimal, tick_size: Decimal) -> Decimal {
    if tick_size == Decimal::ZERO {
        return value;
    }
    (value / tick_size).round() * tick_size
}

/// Round down to lot size (quantity precision). Order sizes are always
/// rounded down so a trade never exceeds the computed bound.
pub fn round_down_to_lot(value: Decimal, lot_size: Decimal) -> Decimal {
    if lot_size == Decimal::ZERO {
        return value;
    }
    (value / lot_size).floor() * lot_size
}

/// Safe division that returns zero if the divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Relative change between an original and a current value, as a ratio.
/// An original of zero is reported as a 100% change.
pub fn relative_change(original: Decimal, current: Decimal) -> Decimal {
    if original == Decimal::ZERO {
        return Decimal::ONE;
    }
    ((current - original) / original).abs()
}

/// Convert a rate to basis points (1 bp = 0.01%).
pub fn to_basis_points(rate: Decimal) -> Decimal {
    rate * dec!(10000)
}

/// Volume-weighted average price over (price, quantity) pairs.
pub fn weighted_average(values: &[(Decimal, Decimal)]) -> Decimal {
    let (sum, weight_sum) = values.iter().fold(
        (Decimal::ZERO, Decimal::ZERO),
        |(sum, weight_sum), (val, weight)| (sum + val * weight, weight_sum + weight),
    );

    safe_div(sum, weight_sum)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_to_tick() {
        assert_eq!(round_to_tick(dec!(101.456), dec!(0.01)), dec!(101.46));
        assert_eq!(round_to_tick(dec!(101.456), dec!(0.10)), dec!(101.50));
    }

    #[test]
    fn test_round_down_to_lot() {
        assert_eq!(round_down_to_lot(dec!(1.567), dec!(0.001)), dec!(1.567));
        assert_eq!(round_down_to_lot(dec!(1.567), dec!(0.01)), dec!(1.56));
        assert_eq!(round_down_to_lot(dec!(1.567), dec!(0.1)), dec!(1.5));
    }

    #[test]
    fn test_safe_div_zero_denominator() {
        assert_eq!(safe_div(dec!(10), Decimal::ZERO), Decimal::ZERO);
        assert_eq!(safe_div(dec!(10), dec!(4)), dec!(2.5));
    }

    #[test]
    fn test_relative_change() {
        assert_eq!(relative_change(dec!(100), dec!(101)), dec!(0.01));
        assert_eq!(relative_change(dec!(100), dec!(99)), dec!(0.01));
        assert_eq!(relative_change(Decimal::ZERO, dec!(5)), Decimal::ONE);
    }

    #[test]
    fn test_basis_points() {
        assert_eq!(to_basis_points(dec!(0.0001)), dec!(1));
        assert_eq!(to_basis_points(dec!(0.01)), dec!(100));
    }

    #[test]
    fn test_weighted_average_blends_prices() {
        let fills = vec![(dec!(100), dec!(2)), (dec!(103), dec!(1))];
        assert_eq!(weighted_average(&fills), dec!(101));
    }
}
