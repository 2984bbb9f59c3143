//! Heat normalization: per-platform min-max, platform-weighted scaling,
//! then period-global normalization so one period's heat sums to 1.0.

use std::collections::HashMap;

use anyhow::Result;
use tracing::info;

use echoman_common::{EchomanError, MergeStatus, PeriodKey, Platform};
use echoman_store::SourceItem;

use crate::deps::PipelineDeps;

/// Fallback share for items that carry no comparable heat: heatless
/// platforms, null heats, and degenerate min == max groups.
const NEUTRAL_HEAT: f64 = 0.5;

/// Pure normalization core over (platform, raw heat) rows. Returns one
/// `heat_normalized` per input row, in input order. The only failure is an
/// empty input.
pub fn normalize_heat(
    rows: &[(Platform, Option<f64>)],
    weights: &HashMap<Platform, f64>,
) -> Result<Vec<f64>, EchomanError> {
    if rows.is_empty() {
        return Err(EchomanError::EmptyPeriod("(in-memory batch)".to_string()));
    }

    // Pass 1: per-platform min-max.
    let mut bounds: HashMap<Platform, (f64, f64)> = HashMap::new();
    for (platform, heat) in rows {
        if let Some(h) = heat {
            let entry = bounds.entry(*platform).or_insert((*h, *h));
            entry.0 = entry.0.min(*h);
            entry.1 = entry.1.max(*h);
        }
    }

    let mut normalized: Vec<f64> = rows
        .iter()
        .map(|(platform, heat)| match (heat, bounds.get(platform)) {
            (Some(h), Some((min, max))) if max > min => (h - min) / (max - min),
            _ => NEUTRAL_HEAT,
        })
        .collect();

    // Pass 2: platform-weighted scaling against the full weight mass.
    let total_weight: f64 = weights.values().sum();
    for (value, (platform, _)) in normalized.iter_mut().zip(rows) {
        let weight = weights.get(platform).copied().unwrap_or(1.0);
        *value = *value * weight / total_weight;
    }

    // Pass 3: period-global normalization. The weighted total is positive for
    // any non-empty input (heatless rows contribute the neutral share), so
    // the period sums to 1.0 modulo float error.
    let total: f64 = normalized.iter().sum();
    if total > 0.0 {
        for value in &mut normalized {
            *value /= total;
        }
    }

    Ok(normalized)
}

/// Normalize a loaded batch of items, write the results back, and update
/// the in-memory copies so callers see the fresh values.
pub async fn normalize_items(deps: &PipelineDeps, items: &mut [SourceItem]) -> Result<()> {
    let rows: Vec<(Platform, Option<f64>)> = items
        .iter()
        .map(|item| Ok((item.platform()?, item.heat_value)))
        .collect::<Result<_, EchomanError>>()?;

    let normalized = normalize_heat(&rows, &deps.config.platform_weights)?;

    for (item, heat) in items.iter_mut().zip(&normalized) {
        SourceItem::set_heat_normalized(item.id, *heat, &deps.pool).await?;
        item.heat_normalized = Some(*heat);
    }

    info!(
        items = items.len(),
        platforms = rows.iter().map(|(p, _)| p).collect::<std::collections::HashSet<_>>().len(),
        "Heat normalization complete"
    );

    Ok(())
}

/// Normalize all `pending_event_merge` items of one period. Returns the
/// item count.
pub async fn normalize_period(deps: &PipelineDeps, period: PeriodKey) -> Result<usize> {
    let mut items =
        SourceItem::pending_for_period(period, MergeStatus::PendingEventMerge, &deps.pool).await?;
    if items.is_empty() {
        return Err(EchomanError::EmptyPeriod(period.to_string()).into());
    }
    normalize_items(deps, &mut items).await?;
    Ok(items.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use echoman_common::default_platform_weights;

    fn sum(values: &[f64]) -> f64 {
        values.iter().sum()
    }

    #[test]
    fn empty_input_is_an_error() {
        let weights = default_platform_weights();
        assert!(normalize_heat(&[], &weights).is_err());
    }

    #[test]
    fn period_sums_to_one() {
        let weights = default_platform_weights();
        let rows = vec![
            (Platform::Weibo, Some(1_000_000.0)),
            (Platform::Weibo, Some(250_000.0)),
            (Platform::Zhihu, Some(900.0)),
            (Platform::Zhihu, Some(100.0)),
            (Platform::Sina, None),
        ];
        let out = normalize_heat(&rows, &weights).unwrap();
        assert!((sum(&out) - 1.0).abs() < 1e-9, "sum = {}", sum(&out));
    }

    #[test]
    fn all_platforms_heatless_split_evenly() {
        let weights = default_platform_weights();
        let rows = vec![
            (Platform::Sina, None),
            (Platform::Sina, None),
            (Platform::Sina, None),
            (Platform::Sina, None),
        ];
        let out = normalize_heat(&rows, &weights).unwrap();
        for value in &out {
            assert!((value - 0.25).abs() < 1e-9, "expected 1/N, got {value}");
        }
    }

    #[test]
    fn max_equals_min_gets_neutral_share() {
        let weights = default_platform_weights();
        // All weibo items identical; a lone baidu item anchors the total.
        let rows = vec![
            (Platform::Weibo, Some(500.0)),
            (Platform::Weibo, Some(500.0)),
            (Platform::Baidu, Some(1.0)),
        ];
        let out = normalize_heat(&rows, &weights).unwrap();
        // Both weibo items collapsed to the same neutral value pre-scaling.
        assert!((out[0] - out[1]).abs() < 1e-12);
        assert!((sum(&out) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn null_heat_on_heated_platform_gets_neutral_share() {
        let weights = default_platform_weights();
        let rows = vec![
            (Platform::Weibo, Some(0.0)),
            (Platform::Weibo, Some(100.0)),
            (Platform::Weibo, None),
        ];
        let out = normalize_heat(&rows, &weights).unwrap();
        // min item → 0, max item → 1, null → 0.5 before global scaling,
        // so the null item lands exactly between them.
        assert!(out[0] < out[2] && out[2] < out[1]);
    }

    #[test]
    fn platform_weight_shifts_share() {
        let weights = default_platform_weights();
        // Identical raw standing on their platforms; weibo weighs 1.2, hupu 0.8.
        let rows = vec![
            (Platform::Weibo, Some(10.0)),
            (Platform::Weibo, Some(5.0)),
            (Platform::Hupu, Some(10.0)),
            (Platform::Hupu, Some(5.0)),
        ];
        let out = normalize_heat(&rows, &weights).unwrap();
        assert!(
            out[0] > out[2],
            "weibo max should out-rank hupu max: {} vs {}",
            out[0],
            out[2]
        );
    }

    #[test]
    fn single_item_takes_the_whole_period() {
        let weights = default_platform_weights();
        let rows = vec![(Platform::Toutiao, Some(123.0))];
        let out = normalize_heat(&rows, &weights).unwrap();
        assert!((out[0] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_weight_defaults_to_one() {
        // A weights map missing a platform must not panic.
        let mut weights = default_platform_weights();
        weights.remove(&Platform::Hupu);
        let rows = vec![(Platform::Hupu, Some(3.0)), (Platform::Hupu, Some(9.0))];
        let out = normalize_heat(&rows, &weights).unwrap();
        assert!((sum(&out) - 1.0).abs() < 1e-9);
    }
}
