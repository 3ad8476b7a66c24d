//! Stay pricing. All money math is decimal — never binary floating point.

use rust_decimal::{Decimal, RoundingStrategy};

use crate::model::StayRange;

/// Total price for a stay: nightly rate × night count, rounded to two
/// decimal places half-up at the final multiplication only.
pub fn total(rate_per_night: Decimal, stay: &StayRange) -> Decimal {
    let nights = Decimal::from(stay.nights());
    (rate_per_night * nights).round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn three_nights_at_fifty() {
        let stay = StayRange::new(d(2024, 1, 1), d(2024, 1, 4));
        let total = total(Decimal::new(5000, 2), &stay);
        assert_eq!(total, Decimal::new(15000, 2)); // 150.00
    }

    #[test]
    fn single_night() {
        let stay = StayRange::new(d(2024, 6, 1), d(2024, 6, 2));
        assert_eq!(total(Decimal::new(9999, 2), &stay), Decimal::new(9999, 2));
    }

    #[test]
    fn no_cent_drift_on_repeating_rate() {
        // 3 nights at 33.335 → 100.005 → rounds half-up to 100.01
        let stay = StayRange::new(d(2024, 6, 1), d(2024, 6, 4));
        let total = total(Decimal::new(33335, 3), &stay);
        assert_eq!(total, Decimal::new(10001, 2));
    }

    #[test]
    fn long_stay_exact() {
        // 365 nights at 100.00 — a float would already show drift here
        let stay = StayRange::new(d(2024, 1, 1), d(2024, 12, 31));
        let total = total(Decimal::new(10000, 2), &stay);
        assert_eq!(total, Decimal::from(36500));
    }
}
