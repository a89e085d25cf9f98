use statrs::statistics::{Data, Distribution};
use ta::indicators::AverageTrueRange;
use ta::Next;

/// Mean of a sample (f64 boundary for the statistical library).
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Data::new(values.to_vec()).mean()
}

/// Sample standard deviation. None below two observations.
pub fn std_dev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let sd = Data::new(values.to_vec()).std_dev()?;
    if sd.is_nan() {
        None
    } else {
        Some(sd)
    }
}

/// Calculate realized volatility from price returns
///
/// Returns annualized volatility (e.g., 0.15 = 15% annual volatility)
/// Uses standard deviation of log returns scaled to annual basis
pub fn realized_volatility(prices: &[f64], periods_per_year: f64) -> Option<f64> {
    let returns = log_returns(prices);
    let sd = std_dev(&returns)?;
    Some(sd * periods_per_year.sqrt())
}

/// Log returns over consecutive positive prices. Non-positive prices are
/// skipped rather than producing NaN.
pub fn log_returns(prices: &[f64]) -> Vec<f64> {
    if prices.len() < 2 {
        return Vec::new();
    }

    let mut returns = Vec::with_capacity(prices.len() - 1);
    for window in prices.windows(2) {
        if window[0] > 0.0 && window[1] > 0.0 {
            returns.push((window[1] / window[0]).ln());
        }
    }
    returns
}

/// Average true range over a close-price series.
///
/// Returns None until at least `period + 1` observations are available;
/// the warm-up values of the indicator are not meaningful.
pub fn average_true_range(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() <= period {
        return None;
    }

    let mut atr = AverageTrueRange::new(period).ok()?;
    let mut last = 0.0;
    for price in prices {
        last = atr.next(*price);
    }
    if last > 0.0 {
        Some(last)
    } else {
        None
    }
}
