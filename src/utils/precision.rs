// src/utils/precision.rs
use crate::types::InstrumentRules;
use rust_decimal::Decimal;

/// Rounds a quantity DOWN to the nearest multiple of step_size.
/// Example: amount=10.999, step=1.0 -> 10
pub fn normalize_quantity(amount: Decimal, step_size: Decimal) -> Decimal {
    if step_size.is_zero() {
        return amount;
    }
    ((amount / step_size).floor() * step_size).normalize()
}

/// Rounds a price to the NEAREST multiple of tick_size.
/// Example: price=100.16, tick=0.1 -> 100.2
pub fn normalize_price(price: Decimal, tick_size: Decimal) -> Decimal {
    if tick_size.is_zero() {
        return price;
    }
    ((price / tick_size).round() * tick_size).normalize()
}

/// Quantity that may be sent for an order, or None when rounding leaves less than the minimum.
pub fn tradable_quantity(amount: Decimal, rules: &InstrumentRules) -> Option<Decimal> {
    let qty = normalize_quantity(amount, rules.qty_step);
    if qty.is_zero() || qty < rules.min_qty {
        None
    } else {
        Some(qty)
    }
}

/// Fractional difference between two quantities relative to the larger one.
pub fn relative_diff(a: Decimal, b: Decimal) -> Decimal {
    let base = a.abs().max(b.abs());
    if base.is_zero() {
        return Decimal::ZERO;
    }
    (a - b).abs() / base
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn quantity_rounds_down() {
        assert_eq!(normalize_quantity(dec!(10.999), dec!(1)), dec!(10));
        assert_eq!(normalize_quantity(dec!(0.0379), dec!(0.001)), dec!(0.037));
        assert_eq!(normalize_quantity(dec!(5), Decimal::ZERO), dec!(5));
    }

    #[test]
    fn price_rounds_to_nearest_tick() {
        assert_eq!(normalize_price(dec!(100.16), dec!(0.1)), dec!(100.2));
        assert_eq!(normalize_price(dec!(49999.94), dec!(0.5)), dec!(50000));
    }

    #[test]
    fn below_min_qty_is_not_tradable() {
        let rules = InstrumentRules {
            symbol: "ETHUSDT".into(),
            qty_step: dec!(0.01),
            tick_size: dec!(0.01),
            min_qty: dec!(0.01),
        };
        assert_eq!(tradable_quantity(dec!(0.009), &rules), None);
        assert_eq!(tradable_quantity(dec!(0.129), &rules), Some(dec!(0.12)));
    }

    #[test]
    fn relative_diff_is_symmetric() {
        assert_eq!(relative_diff(dec!(1), dec!(0.5)), dec!(0.5));
        assert_eq!(relative_diff(dec!(0.5), dec!(1)), dec!(0.5));
        assert_eq!(relative_diff(Decimal::ZERO, Decimal::ZERO), Decimal::ZERO);
    }
}
