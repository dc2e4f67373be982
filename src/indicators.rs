//! Technical indicators
//!
//! Moving averages, Donchian channel midline and average true range used by
//! the band calculator. Every series function returns one entry per input value,
//! `None` until the lookback window is filled.

/// Calculate Simple Moving Average
pub fn sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut result = Vec::with_capacity(values.len());
    if period == 0 {
        return vec![None; values.len()];
    }

    for i in 0..values.len() {
        if i + 1 < period {
            result.push(None);
        } else {
            let sum: f64 = values[i + 1 - period..=i].iter().sum();
            result.push(Some(sum / period as f64));
        }
    }

    result
}

/// Calculate Exponential Moving Average, seeded with the SMA of the first window
pub fn ema(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut result = Vec::with_capacity(values.len());

    if values.is_empty() || period == 0 {
        return vec![None; values.len()];
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut ema_value: Option<f64> = None;

    for (i, &value) in values.iter().enumerate() {
        if i + 1 < period {
            result.push(None);
        } else if i + 1 == period {
            let sum: f64 = values[0..period].iter().sum();
            ema_value = Some(sum / period as f64);
            result.push(ema_value);
        } else if let Some(prev_ema) = ema_value {
            let new_ema = (value - prev_ema) * multiplier + prev_ema;
            ema_value = Some(new_ema);
            result.push(Some(new_ema));
        }
    }

    result
}

/// Calculate Weighted Moving Average (linear weights, newest bar heaviest)
pub fn wma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    if period == 0 {
        return vec![None; values.len()];
    }

    let denominator = (period * (period + 1)) as f64 / 2.0;

    (0..values.len())
        .map(|i| {
            if i + 1 < period {
                return None;
            }
            let weighted: f64 = values[i + 1 - period..=i]
                .iter()
                .enumerate()
                .map(|(w, v)| (w + 1) as f64 * v)
                .sum();
            Some(weighted / denominator)
        })
        .collect()
}

/// Donchian channel midline: (highest high + lowest low) / 2 over the window
pub fn donchian_mid(high: &[f64], low: &[f64], period: usize) -> Vec<Option<f64>> {
    if period == 0 {
        return vec![None; high.len()];
    }

    (0..high.len())
        .map(|i| {
            if i + 1 < period {
                return None;
            }
            let start = i + 1 - period;
            let upper = high[start..=i].iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let lower = low[start..=i].iter().copied().fold(f64::INFINITY, f64::min);
            Some((upper + lower) / 2.0)
        })
        .collect()
}

/// Calculate True Range
pub fn true_range(high: &[f64], low: &[f64], close: &[f64]) -> Vec<f64> {
    let mut tr = Vec::with_capacity(high.len());

    for i in 0..high.len() {
        let tr_value = if i == 0 {
            high[i] - low[i]
        } else {
            let hl = high[i] - low[i];
            let hc = (high[i] - close[i - 1]).abs();
            let lc = (low[i] - close[i - 1]).abs();
            hl.max(hc).max(lc)
        };
        tr.push(tr_value);
    }

    tr
}

/// Calculate Average True Range (ATR)
pub fn atr(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<Option<f64>> {
    let tr = true_range(high, low, close);
    ema(&tr, period)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_sma() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let result = sma(&values, 3);

        assert_eq!(result[0], None);
        assert_eq!(result[1], None);
        assert_eq!(result[2], Some(2.0));
        assert_eq!(result[3], Some(3.0));
        assert_eq!(result[4], Some(4.0));
    }

    #[test]
    fn test_ema() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let result = ema(&values, 3);

        assert_eq!(result[0], None);
        assert_eq!(result[1], None);
        assert_eq!(result[2], Some(2.0));
        // (4 - 2) * 0.5 + 2
        assert_eq!(result[3], Some(3.0));
        assert_eq!(result.len(), values.len());
    }

    #[test]
    fn test_wma() {
        let values = vec![1.0, 2.0, 3.0];
        let result = wma(&values, 3);

        assert_eq!(result[1], None);
        // (1*1 + 2*2 + 3*3) / 6
        assert_relative_eq!(result[2].unwrap(), 14.0 / 6.0);
    }

    #[test]
    fn test_donchian_mid() {
        let high = vec![10.0, 12.0, 11.0, 15.0];
        let low = vec![8.0, 9.0, 7.0, 10.0];
        let result = donchian_mid(&high, &low, 3);

        assert_eq!(result[1], None);
        assert_eq!(result[2], Some((12.0 + 7.0) / 2.0));
        assert_eq!(result[3], Some((15.0 + 7.0) / 2.0));
    }

    #[test]
    fn test_true_range_uses_previous_close() {
        let high = vec![10.0, 11.0];
        let low = vec![9.0, 10.5];
        let close = vec![9.5, 11.0];
        let tr = true_range(&high, &low, &close);

        assert_eq!(tr[0], 1.0);
        // gap up: |11 - 9.5| beats the 0.5 bar range
        assert_eq!(tr[1], 1.5);
    }

    #[test]
    fn test_zero_period_is_all_none() {
        let values = vec![1.0, 2.0];
        assert!(sma(&values, 0).iter().all(Option::is_none));
        assert!(ema(&values, 0).iter().all(Option::is_none));
        assert!(wma(&values, 0).iter().all(Option::is_none));
    }
}
