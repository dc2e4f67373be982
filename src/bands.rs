//! Envelope band calculator
//!
//! Turns an OHLCV history into a reference average and a ladder of entry bands
//! below it. The ladder is either a fixed list of envelope percentages or an
//! ATR-driven adaptive ladder whose depth follows current volatility.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

use crate::indicators;
use crate::Candle;

/// Data and configuration errors raised while building a band ladder.
/// None of them may lead to order placement.
#[derive(Debug, Error, PartialEq)]
pub enum BandError {
    #[error("insufficient history: need {required} closed bars, have {available}")]
    InsufficientHistory { required: usize, available: usize },

    #[error("the average type {0} is not supported")]
    UnsupportedAverageMethod(String),

    #[error("degenerate band ladder: {0}")]
    DegenerateBands(String),
}

/// Reference average used as the band anchor and the take-profit level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AverageMethod {
    Sma,
    Ema,
    Wma,
    DonchianMid,
}

impl FromStr for AverageMethod {
    type Err = BandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SMA" => Ok(AverageMethod::Sma),
            "EMA" => Ok(AverageMethod::Ema),
            "WMA" => Ok(AverageMethod::Wma),
            "DCM" | "DONCHIAN-MID" | "DONCHIAN_MID" | "DONCHIANMID" => {
                Ok(AverageMethod::DonchianMid)
            }
            _ => Err(BandError::UnsupportedAverageMethod(s.to_string())),
        }
    }
}

impl AverageMethod {
    fn series(self, candles: &[Candle], period: usize) -> Vec<Option<f64>> {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        match self {
            AverageMethod::Sma => indicators::sma(&closes, period),
            AverageMethod::Ema => indicators::ema(&closes, period),
            AverageMethod::Wma => indicators::wma(&closes, period),
            AverageMethod::DonchianMid => {
                let highs: Vec<f64> = candles.iter().map(|c| c.high).collect();
                let lows: Vec<f64> = candles.iter().map(|c| c.low).collect();
                indicators::donchian_mid(&highs, &lows, period)
            }
        }
    }
}

/// Parameters of the volatility-adaptive ladder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveBands {
    pub base_envelope_pct: f64,
    #[serde(default = "default_atr_period")]
    pub atr_period: usize,
    #[serde(default = "default_min_bands")]
    pub min_bands: usize,
    #[serde(default = "default_max_bands")]
    pub max_bands: usize,
}

fn default_atr_period() -> usize {
    14
}

fn default_min_bands() -> usize {
    3
}

fn default_max_bands() -> usize {
    10
}

/// How band prices are derived from the reference average
#[derive(Debug, Clone, PartialEq)]
pub enum BandMode {
    /// `band_i = average * (1 - e_i)`, envelopes in ascending depth
    Fixed(Vec<f64>),
    /// `band_i = average * (1 - base * i * atr)` for `i in 1..=n`
    Adaptive(AdaptiveBands),
}

/// One entry level. `index` is 1-based, nearest band first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Band {
    pub index: usize,
    pub price: f64,
}

impl Band {
    /// Trigger sits slightly above the band so the order only arms once price
    /// actually approaches it
    pub fn trigger_price(&self, delta: f64) -> f64 {
        self.price * (1.0 + delta)
    }
}

/// Ladder derived from the latest closed bar. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct BandSet {
    /// Reference average at the latest closed bar
    pub reference_price: f64,
    /// Close of the latest closed bar
    pub last_close: f64,
    pub bands: Vec<Band>,
}

impl BandSet {
    pub fn len(&self) -> usize {
        self.bands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bands.is_empty()
    }

    pub fn prices(&self) -> Vec<f64> {
        self.bands.iter().map(|b| b.price).collect()
    }
}

/// Band count for the adaptive ladder: `clamp(round(ratio * max), min, max)`.
/// NaN and non-positive ratios fall back to `min_bands`, an infinite ratio
/// saturates at `max_bands`.
pub fn adaptive_band_count(volatility_ratio: f64, min_bands: usize, max_bands: usize) -> usize {
    let (lo, hi) = (min_bands.min(max_bands), min_bands.max(max_bands));
    if volatility_ratio.is_nan() || volatility_ratio <= 0.0 {
        return lo;
    }
    if volatility_ratio.is_infinite() {
        return hi;
    }
    // `as` saturates for huge values
    let raw = (volatility_ratio * hi as f64).round() as usize;
    raw.clamp(lo, hi)
}

#[derive(Debug, Clone)]
pub struct BandCalculator {
    method: AverageMethod,
    period: usize,
    mode: BandMode,
}

impl BandCalculator {
    pub fn new(method: AverageMethod, period: usize, mode: BandMode) -> Self {
        Self {
            method,
            period,
            mode,
        }
    }

    /// Build the ladder from a freshly fetched series (oldest first). The final
    /// bar is still forming and is always dropped.
    pub fn compute(&self, candles: &[Candle]) -> Result<BandSet, BandError> {
        let closed = match candles.split_last() {
            Some((_, closed)) => closed,
            None => &[],
        };

        let required = self.required_bars();
        if closed.len() < required {
            return Err(BandError::InsufficientHistory {
                required,
                available: closed.len(),
            });
        }

        let reference_price = self
            .method
            .series(closed, self.period)
            .last()
            .copied()
            .flatten()
            .ok_or(BandError::InsufficientHistory {
                required,
                available: closed.len(),
            })?;
        let last_close = closed[closed.len() - 1].close;

        let prices = match &self.mode {
            BandMode::Fixed(envelopes) => fixed_prices(reference_price, envelopes),
            BandMode::Adaptive(params) => adaptive_prices(reference_price, closed, params)?,
        };

        check_ladder(&prices)?;

        Ok(BandSet {
            reference_price,
            last_close,
            bands: prices
                .into_iter()
                .enumerate()
                .map(|(i, price)| Band {
                    index: i + 1,
                    price,
                })
                .collect(),
        })
    }

    fn required_bars(&self) -> usize {
        match &self.mode {
            BandMode::Fixed(_) => self.period.max(1),
            BandMode::Adaptive(params) => self.period.max(params.atr_period).max(1),
        }
    }
}

fn fixed_prices(average: f64, envelopes: &[f64]) -> Vec<f64> {
    envelopes.iter().map(|e| average * (1.0 - e)).collect()
}

fn adaptive_prices(
    average: f64,
    closed: &[Candle],
    params: &AdaptiveBands,
) -> Result<Vec<f64>, BandError> {
    let highs: Vec<f64> = closed.iter().map(|c| c.high).collect();
    let lows: Vec<f64> = closed.iter().map(|c| c.low).collect();
    let closes: Vec<f64> = closed.iter().map(|c| c.close).collect();

    let atr_latest = indicators::atr(&highs, &lows, &closes, params.atr_period)
        .last()
        .copied()
        .flatten()
        .ok_or(BandError::InsufficientHistory {
            required: params.atr_period,
            available: closed.len(),
        })?;

    let window = &closes[closes.len() - params.atr_period.max(1)..];
    let mean_close = window.iter().sum::<f64>() / window.len() as f64;
    let ratio = if mean_close > 0.0 {
        atr_latest / mean_close
    } else {
        0.0
    };

    let count = adaptive_band_count(ratio, params.min_bands, params.max_bands);
    tracing::debug!(
        "Adaptive ladder: atr={:.6} mean_close={:.6} ratio={:.6} bands={}",
        atr_latest,
        mean_close,
        ratio,
        count
    );

    Ok((1..=count)
        .map(|i| average * (1.0 - params.base_envelope_pct * i as f64 * atr_latest))
        .collect())
}

fn check_ladder(prices: &[f64]) -> Result<(), BandError> {
    if prices.is_empty() {
        return Err(BandError::DegenerateBands("no bands configured".to_string()));
    }
    if let Some(p) = prices.iter().find(|p| !p.is_finite() || **p <= 0.0) {
        return Err(BandError::DegenerateBands(format!(
            "band price {} is not a positive number",
            p
        )));
    }
    if let Some((a, b)) = prices.iter().tuple_windows().find(|(a, b)| a <= b) {
        return Err(BandError::DegenerateBands(format!(
            "bands must strictly decrease, got {} then {}",
            a, b
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::{Duration, Utc};

    fn flat_candles(count: usize, price: f64, range: f64) -> Vec<Candle> {
        let start = Utc::now() - Duration::hours(count as i64);
        (0..count)
            .map(|i| Candle {
                datetime: start + Duration::hours(i as i64),
                open: price,
                high: price + range / 2.0,
                low: price - range / 2.0,
                close: price,
                volume: 10.0,
            })
            .collect()
    }

    #[test]
    fn test_parse_average_methods() {
        assert_eq!("sma".parse::<AverageMethod>().unwrap(), AverageMethod::Sma);
        assert_eq!("DCM".parse::<AverageMethod>().unwrap(), AverageMethod::DonchianMid);
        assert_eq!(
            "Donchian-mid".parse::<AverageMethod>().unwrap(),
            AverageMethod::DonchianMid
        );
        assert_eq!(
            "HMA".parse::<AverageMethod>(),
            Err(BandError::UnsupportedAverageMethod("HMA".to_string()))
        );
    }

    #[test]
    fn test_fixed_bands_at_average_100() {
        let calculator = BandCalculator::new(
            AverageMethod::Sma,
            5,
            BandMode::Fixed(vec![0.07, 0.11, 0.14]),
        );
        let bands = calculator.compute(&flat_candles(10, 100.0, 2.0)).unwrap();

        assert_relative_eq!(bands.reference_price, 100.0);
        let prices = bands.prices();
        assert_relative_eq!(prices[0], 93.0, epsilon = 1e-9);
        assert_relative_eq!(prices[1], 89.0, epsilon = 1e-9);
        assert_relative_eq!(prices[2], 86.0, epsilon = 1e-9);
        assert_eq!(bands.bands[2].index, 3);
        assert_relative_eq!(bands.bands[0].trigger_price(0.005), 93.465, epsilon = 1e-9);
    }

    #[test]
    fn test_in_progress_bar_is_dropped() {
        let mut candles = flat_candles(6, 100.0, 2.0);
        // a wild forming bar must not move the average
        candles.last_mut().unwrap().close = 1_000.0;
        let calculator =
            BandCalculator::new(AverageMethod::Sma, 5, BandMode::Fixed(vec![0.1]));

        let bands = calculator.compute(&candles).unwrap();
        assert_relative_eq!(bands.reference_price, 100.0);
        assert_relative_eq!(bands.last_close, 100.0);
    }

    #[test]
    fn test_insufficient_history() {
        let calculator =
            BandCalculator::new(AverageMethod::Ema, 5, BandMode::Fixed(vec![0.1]));
        // five bars, one of which is dropped
        let err = calculator.compute(&flat_candles(5, 100.0, 2.0)).unwrap_err();
        assert_eq!(
            err,
            BandError::InsufficientHistory {
                required: 5,
                available: 4
            }
        );
        assert!(calculator.compute(&[]).is_err());
    }

    #[test]
    fn test_non_ascending_envelopes_rejected() {
        let calculator = BandCalculator::new(
            AverageMethod::Sma,
            3,
            BandMode::Fixed(vec![0.11, 0.07]),
        );
        assert!(matches!(
            calculator.compute(&flat_candles(10, 100.0, 2.0)),
            Err(BandError::DegenerateBands(_))
        ));
    }

    #[test]
    fn test_adaptive_band_count_is_clamped() {
        assert_eq!(adaptive_band_count(0.0, 3, 10), 3);
        assert_eq!(adaptive_band_count(f64::NAN, 3, 10), 3);
        assert_eq!(adaptive_band_count(f64::NEG_INFINITY, 3, 10), 3);
        assert_eq!(adaptive_band_count(f64::MAX, 3, 10), 10);
        assert_eq!(adaptive_band_count(1e12, 3, 10), 10);
        assert_eq!(adaptive_band_count(f64::INFINITY, 3, 10), 10);
        assert_eq!(adaptive_band_count(0.5, 3, 10), 5);
        for step in 0..200 {
            let n = adaptive_band_count(step as f64 * 0.01, 3, 10);
            assert!((3..=10).contains(&n));
        }
    }

    #[test]
    fn test_adaptive_bands_strictly_decrease() {
        let calculator = BandCalculator::new(
            AverageMethod::Sma,
            5,
            BandMode::Adaptive(AdaptiveBands {
                base_envelope_pct: 0.01,
                atr_period: 14,
                min_bands: 3,
                max_bands: 10,
            }),
        );
        let bands = calculator.compute(&flat_candles(40, 100.0, 2.0)).unwrap();

        // ATR of a constant 2.0 range, ratio 0.02 -> clamp to min
        assert_eq!(bands.len(), 3);
        let prices = bands.prices();
        assert!(prices.iter().tuple_windows().all(|(a, b)| a > b));
        assert_relative_eq!(prices[0], 100.0 * (1.0 - 0.01 * 2.0), epsilon = 1e-9);
    }

    #[test]
    fn test_adaptive_zero_volatility_is_degenerate() {
        let calculator = BandCalculator::new(
            AverageMethod::Sma,
            5,
            BandMode::Adaptive(AdaptiveBands {
                base_envelope_pct: 0.01,
                atr_period: 14,
                min_bands: 3,
                max_bands: 10,
            }),
        );
        assert!(matches!(
            calculator.compute(&flat_candles(40, 100.0, 0.0)),
            Err(BandError::DegenerateBands(_))
        ));
    }
}
