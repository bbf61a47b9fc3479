//! Net positions, rolling percentile-rank indices and week-over-week deltas.

use std::collections::BTreeMap;

use cot_core::{ContractId, MetricRecord, TraderCategory, WeeklyObservation, LOOKBACK_WEEKS};

/// Percentile rank of `current` within `window`, in `[0, 100]`.
///
/// Rank is the count of window entries `<=` current, so ties at the
/// maximum share the highest index.
pub fn percentile_rank(window: &[i64], current: i64) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    let rank = window.iter().filter(|v| **v <= current).count();
    (rank as f64 / window.len() as f64) * 100.0
}

/// Trailing window ending at and including position `i`.
pub fn trailing_window(values: &[i64], i: usize, lookback: usize) -> &[i64] {
    let len = (i + 1).min(lookback);
    &values[i + 1 - len..=i]
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct CategorySignal {
    net: i64,
    index: f64,
    delta: Option<i64>,
}

fn category_signals(nets: &[i64], lookback: usize) -> Vec<CategorySignal> {
    (0..nets.len())
        .map(|i| CategorySignal {
            net: nets[i],
            index: percentile_rank(trailing_window(nets, i, lookback), nets[i]),
            delta: i.checked_sub(1).map(|prev| nets[i] - nets[prev]),
        })
        .collect()
}

/// Metrics for one contract's complete series, which must be sorted ascending
/// by report date. One record per observation, same order.
pub fn compute_contract_metrics(series: &[WeeklyObservation]) -> Vec<MetricRecord> {
    compute_contract_metrics_with_lookback(series, LOOKBACK_WEEKS)
}

pub fn compute_contract_metrics_with_lookback(
    series: &[WeeklyObservation],
    lookback: usize,
) -> Vec<MetricRecord> {
    debug_assert!(series.windows(2).all(|w| w[0].report_date < w[1].report_date));
    let lookback = lookback.max(1);

    let [comm, ls, ss] = TraderCategory::ALL.map(|category| {
        let nets = series.iter().map(|obs| obs.net(category)).collect::<Vec<_>>();
        category_signals(&nets, lookback)
    });

    series
        .iter()
        .enumerate()
        .map(|(i, obs)| MetricRecord {
            contract_id: obs.contract_id,
            report_date: obs.report_date,
            comm_net: comm[i].net,
            ls_net: ls[i].net,
            ss_net: ss[i].net,
            comm_index: comm[i].index,
            ls_index: ls[i].index,
            ss_index: ss[i].index,
            wow_comm_delta: comm[i].delta,
            wow_ls_delta: ls[i].delta,
            wow_ss_delta: ss[i].delta,
        })
        .collect()
}

/// Group observations by contract, sort each group by date and compute metrics.
/// Output is ordered by contract then report date.
pub fn compute_metrics(observations: &[WeeklyObservation]) -> Vec<MetricRecord> {
    let mut by_contract: BTreeMap<ContractId, Vec<WeeklyObservation>> = BTreeMap::new();
    for obs in observations {
        by_contract.entry(obs.contract_id).or_default().push(obs.clone());
    }

    by_contract
        .into_values()
        .flat_map(|mut series| {
            series.sort_by_key(|obs| obs.report_date);
            series.dedup_by_key(|obs| obs.report_date);
            compute_contract_metrics(&series)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};

    fn series(contract_id: ContractId, comm_nets: &[i64]) -> Vec<WeeklyObservation> {
        let start = NaiveDate::from_ymd_opt(2015, 1, 6).unwrap();
        comm_nets
            .iter()
            .enumerate()
            .map(|(i, net)| WeeklyObservation {
                contract_id,
                report_date: start + Duration::weeks(i as i64),
                prod_class: None,
                comm_long: 1_000 + net,
                comm_short: 1_000,
                ls_long: 50 + i as i64,
                ls_short: 50,
                ss_long: 10,
                ss_short: 10 + (i as i64 % 3),
                open_interest: None,
            })
            .collect()
    }

    #[test]
    fn two_week_series_second_index_is_max_when_value_rises_or_holds() {
        let id = ContractId::new_v4();
        for nets in [[10, 20], [10, 10]] {
            let metrics = compute_contract_metrics(&series(id, &nets));
            assert_eq!(metrics.len(), 2);
            assert_eq!(metrics[0].comm_index, 100.0);
            assert_eq!(metrics[1].comm_index, 100.0);
        }

        let falling = compute_contract_metrics(&series(id, &[20, 10]));
        assert_eq!(falling[1].comm_index, 50.0);
    }

    #[test]
    fn first_record_has_null_deltas_and_later_ones_are_exact_differences() {
        let id = ContractId::new_v4();
        let obs = series(id, &[5, -3, 12, 12, 40]);
        let metrics = compute_contract_metrics(&obs);

        assert!(TraderCategory::ALL.iter().all(|c| metrics[0].delta(*c).is_none()));
        for i in 1..metrics.len() {
            for category in TraderCategory::ALL {
                assert_eq!(
                    metrics[i].delta(category),
                    Some(obs[i].net(category) - obs[i - 1].net(category))
                );
            }
        }
        assert_eq!(metrics[3].wow_comm_delta, Some(0));
    }

    #[test]
    fn window_is_capped_at_lookback_and_never_precedes_series_start() {
        let values = (0..400).collect::<Vec<i64>>();
        assert_eq!(trailing_window(&values, 0, LOOKBACK_WEEKS), &[0]);
        assert_eq!(trailing_window(&values, 9, LOOKBACK_WEEKS).len(), 10);
        assert_eq!(trailing_window(&values, 155, LOOKBACK_WEEKS).len(), 156);
        let capped = trailing_window(&values, 399, LOOKBACK_WEEKS);
        assert_eq!(capped.len(), 156);
        assert_eq!(capped[0], 244);
        assert_eq!(*capped.last().unwrap(), 399);
    }

    #[test]
    fn old_extremes_fall_out_of_the_window() {
        let id = ContractId::new_v4();
        // one huge early reading, then a flat-ish decline
        let mut nets = vec![1_000_000];
        nets.extend((0..200).map(|i| 500 - i));
        let metrics = compute_contract_metrics(&series(id, &nets));

        // still inside the window: the early spike dominates
        assert!((metrics[100].comm_index - (1.0 / 101.0) * 100.0).abs() < 1e-9);
        // once the spike has rolled off, the lowest value in the window ranks 1/156
        let last = metrics.last().unwrap();
        assert!((last.comm_index - (1.0 / 156.0) * 100.0).abs() < 1e-9);
    }

    #[test]
    fn strictly_increasing_series_always_reads_100() {
        let id = ContractId::new_v4();
        let nets = (0..300).map(|i| i * 7 - 500).collect::<Vec<_>>();
        for metric in compute_contract_metrics(&series(id, &nets)) {
            assert_eq!(metric.comm_index, 100.0);
        }
    }

    #[test]
    fn indices_stay_within_bounds() {
        let id = ContractId::new_v4();
        let nets = (0..500)
            .map(|i: i64| ((i * 7919) % 613) - 300)
            .collect::<Vec<_>>();
        for metric in compute_contract_metrics(&series(id, &nets)) {
            for category in TraderCategory::ALL {
                let index = metric.index(category);
                assert!((0.0..=100.0).contains(&index), "index {index} out of range");
            }
        }
    }

    #[test]
    fn compute_metrics_groups_and_sorts_each_contract() {
        let a = ContractId::new_v4();
        let b = ContractId::new_v4();
        let mut mixed = series(a, &[1, 2, 3]);
        mixed.extend(series(b, &[9, 8]));
        mixed.reverse();

        let metrics = compute_metrics(&mixed);
        assert_eq!(metrics.len(), 5);
        for contract in [a, b] {
            let own = metrics
                .iter()
                .filter(|m| m.contract_id == contract)
                .collect::<Vec<_>>();
            assert!(own.windows(2).all(|w| w[0].report_date < w[1].report_date));
            assert!(own[0].wow_comm_delta.is_none());
            assert!(own[1..].iter().all(|m| m.wow_comm_delta.is_some()));
        }
    }

    #[test]
    fn percentile_rank_of_empty_window_is_zero() {
        assert_eq!(percentile_rank(&[], 5), 0.0);
        assert_eq!(percentile_rank(&[1, 2, 3, 4], 2), 50.0);
    }
}
