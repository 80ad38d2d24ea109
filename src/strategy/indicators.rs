//! Streaming indicators for the optional entry filters.

use rust_decimal::Decimal;

/// Exponential moving average fed one close at a time.
#[derive(Debug, Clone)]
pub struct Ema {
    alpha: Decimal,
    value: Option<Decimal>,
}

impl Ema {
    pub fn new(period: usize) -> Self {
        let period = period.max(1);
        Self {
            alpha: Decimal::TWO / Decimal::from(period as u64 + 1),
            value: None,
        }
    }

    pub fn update(&mut self, close: Decimal) -> Decimal {
        let next = match self.value {
            Some(prev) => prev + self.alpha * (close - prev),
            None => close,
        };
        self.value = Some(next);
        next
    }

    pub fn value(&self) -> Option<Decimal> {
        self.value
    }
}

/// MACD histogram = (fast EMA - slow EMA) - signal EMA of that line.
#[derive(Debug, Clone)]
pub struct Macd {
    ema_fast: Ema,
    ema_slow: Ema,
    ema_signal: Ema,
    histogram: Decimal,
}

impl Macd {
    pub fn new(fast: usize, slow: usize, signal: usize) -> Self {
        Self {
            ema_fast: Ema::new(fast),
            ema_slow: Ema::new(slow),
            ema_signal: Ema::new(signal),
            histogram: Decimal::ZERO,
        }
    }

    /// Feed one close price, return the updated histogram.
    pub fn update(&mut self, close: Decimal) -> Decimal {
        let fast = self.ema_fast.update(close);
        let slow = self.ema_slow.update(close);
        let line = fast - slow;
        let signal = self.ema_signal.update(line);
        self.histogram = line - signal;
        self.histogram
    }

    pub fn histogram(&self) -> Decimal {
        self.histogram
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_ema_seeds_with_first_value() {
        let mut ema = Ema::new(10);
        assert_eq!(ema.update(dec!(100)), dec!(100));
        // Second value pulls toward the new close.
        let second = ema.update(dec!(110));
        assert!(second > dec!(100) && second < dec!(110));
    }

    #[test]
    fn test_macd_histogram_turns_positive_in_uptrend() {
        let mut macd = Macd::new(3, 6, 2);
        let mut last = Decimal::ZERO;
        for i in 0..20 {
            last = macd.update(dec!(100) + Decimal::from(i));
        }
        assert!(last > Decimal::ZERO);
    }

    #[test]
    fn test_macd_flat_series_stays_near_zero() {
        let mut macd = Macd::new(12, 26, 9);
        for _ in 0..50 {
            macd.update(dec!(100));
        }
        assert_eq!(macd.histogram(), Decimal::ZERO);
    }
}
