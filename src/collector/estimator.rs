use crate::collector::timeline::PartitionSamples;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimationMethod {
    Interpolation,
    Extrapolation,
}

#[derive(Debug, Clone, Copy)]
pub struct LagEstimate {
    /// Estimated milliseconds between now and the wall time at which the
    /// producer reached the consumer's committed offset. May be negative
    /// when the consumer is ahead of the known producer timeline.
    pub lag_ms: f64,
    pub method: EstimationMethod,
}

/// Estimates time lag for one (group, topic, partition) from its producer
/// offset timeline and the group's latest committed offset.
///
/// With the committed offset below the tracked window the estimate
/// extrapolates from the window endpoints; inside the window it interpolates
/// between the nearest samples; at or past the newest sample it extrapolates
/// forward from the two most recent samples.
///
/// Returns `None` with fewer than two samples.
pub fn estimate_time_lag(
    samples: &PartitionSamples,
    committed: i64,
    now_ms: i64,
) -> Option<LagEstimate> {
    if samples.len() < 2 {
        return None;
    }
    let offsets: Vec<i64> = samples.keys().copied().collect();
    let lowest = offsets[0];
    let highest = offsets[offsets.len() - 1];

    let (produced_at_ms, method) = if committed < lowest {
        let t_high = samples[&highest] as f64;
        let t_low = samples[&lowest] as f64;
        let slope = (t_high - t_low) / (highest - lowest) as f64;
        (
            t_high - (highest - committed) as f64 * slope,
            EstimationMethod::Extrapolation,
        )
    } else {
        let (upper, lower) = bounding_offsets(&offsets, committed);
        let t_upper = samples[&upper] as f64;
        let produced_at = if upper == lower {
            // The consumer sits exactly on the oldest sample.
            t_upper
        } else {
            let t_lower = samples[&lower] as f64;
            let slope = (t_upper - t_lower) / (upper - lower) as f64;
            t_upper - (upper - committed) as f64 * slope
        };
        (produced_at, EstimationMethod::Interpolation)
    };

    Some(LagEstimate {
        lag_ms: now_ms as f64 - produced_at_ms,
        method,
    })
}

/// Smallest tracked offset ≥ `committed` and largest tracked offset below
/// it. At or beyond the newest sample both bounds degenerate to the two most
/// recent samples, extrapolating forward. Requires `committed ≥ offsets[0]`
/// and at least two offsets.
fn bounding_offsets(offsets: &[i64], committed: i64) -> (i64, i64) {
    let index = offsets.partition_point(|&offset| offset < committed);
    if index >= offsets.len() - 1 {
        return (offsets[offsets.len() - 1], offsets[offsets.len() - 2]);
    }
    let upper = offsets[index];
    let lower = if index == 0 { offsets[0] } else { offsets[index - 1] };
    (upper, lower)
}
