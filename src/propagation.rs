use crate::reducer::ReducerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PropagationError {
    #[error("iteration {row} has travel times for {got} stops; expected {expected}")]
    RaggedStopMatrix {
        row: usize,
        expected: usize,
        got: usize,
    },
    #[error("egress tables cover {got} targets; expected {expected}")]
    TargetCountMismatch { expected: usize, got: usize },
    #[error(transparent)]
    Reducer(#[from] ReducerError),
}

/// Sink for the propagation kernel, one call per target. A trait rather than
/// a closure so the reducer can keep its own accumulators without capture
/// gymnastics.
pub trait PropagationConsumer {
    /// Full per-iteration travel times for one target. The slice is scratch
    /// owned by the propagator and may be destructively sorted.
    fn accept(&mut self, target: usize, travel_times_seconds: &mut [i32]) -> Result<(), ReducerError>;

    /// A travel time that does not vary by iteration (street-only access,
    /// or a target skipped because the street time already beats the cutoff).
    fn accept_unvarying(&mut self, target: usize, seconds: i32) -> Result<(), ReducerError>;
}

/// For each target, the transit stops within egress walking range and the
/// walking distance to each, millimeters. Precomputed once per destination
/// pointset and reused across every origin of a job.
pub struct EgressTables {
    pub stops_for_target: Vec<Vec<(u32, u32)>>,
}

/// Propagates travel times at transit stops out to the destination targets.
///
/// The routing stage produces `travel_times_to_stops[iteration][stop]`; this
/// kernel combines each target's nearby stops with every iteration's time at
/// those stops, keeps the per-iteration minimum against the pure street
/// time, and hands the finished distribution to the consumer.
pub struct PerTargetPropagator<'a> {
    travel_times_to_stops: &'a [Vec<i32>],
    non_transit_times: &'a [i32],
    egress: &'a EgressTables,
    walk_speed_mm_per_s: i32,
    cutoff_seconds: i32,
    save_travel_times: bool,
}

impl<'a> PerTargetPropagator<'a> {
    pub fn new(
        travel_times_to_stops: &'a [Vec<i32>],
        non_transit_times: &'a [i32],
        egress: &'a EgressTables,
        walk_speed_mps: f32,
        cutoff_seconds: i32,
        save_travel_times: bool,
    ) -> PerTargetPropagator<'a> {
        // integer millimeters per second: float math in the hot loop costs
        // measurably, and integer division buckets identically on every
        // platform. A walk speed under 1 mm/s would divide by zero.
        let walk_speed_mm_per_s = ((walk_speed_mps * 1000.0) as i32).max(1);
        PerTargetPropagator {
            travel_times_to_stops,
            non_transit_times,
            egress,
            walk_speed_mm_per_s,
            cutoff_seconds,
            save_travel_times,
        }
    }

    pub fn propagate<C: PropagationConsumer>(&self, consumer: &mut C) -> Result<(), PropagationError> {
        let n_iterations = self.travel_times_to_stops.len();
        let n_stops = self
            .travel_times_to_stops
            .first()
            .map(|row| row.len())
            .unwrap_or(0);
        let n_targets = self.non_transit_times.len();
        if self.egress.stops_for_target.len() != n_targets {
            return Err(PropagationError::TargetCountMismatch {
                expected: n_targets,
                got: self.egress.stops_for_target.len(),
            });
        }

        // Transpose to stop-major so the inner loop walks one stop's column
        // of iterations contiguously. The natural iteration-major layout
        // scatters a target's few dozen relevant stops across every row;
        // inverted, the times for the stops near the current target stay hot
        // in cache, and row-major targets mean the next target mostly reuses
        // them.
        let mut at_stop = vec![0i32; n_stops * n_iterations];
        for (iteration, row) in self.travel_times_to_stops.iter().enumerate() {
            if row.len() != n_stops {
                return Err(PropagationError::RaggedStopMatrix {
                    row: iteration,
                    expected: n_stops,
                    got: row.len(),
                });
            }
            for (stop, &seconds) in row.iter().enumerate() {
                at_stop[stop * n_iterations + iteration] = seconds;
            }
        }

        // reused across targets; no allocation inside the target loop
        let mut per_iteration = vec![0i32; n_iterations];

        for target in 0..n_targets {
            let non_transit = self.non_transit_times[target];
            let reached_on_street = non_transit < self.cutoff_seconds;

            if reached_on_street && !self.save_travel_times {
                // accessibility only: transit cannot change "reached in
                // every iteration", so skip the stop scan entirely
                consumer.accept_unvarying(target, non_transit)?;
                continue;
            }

            per_iteration.fill(non_transit);

            for &(stop, distance_mm) in &self.egress.stops_for_target[target] {
                let egress_seconds = distance_mm as i32 / self.walk_speed_mm_per_s;
                let column =
                    &at_stop[stop as usize * n_iterations..(stop as usize + 1) * n_iterations];
                for (best, &time_at_stop) in per_iteration.iter_mut().zip(column) {
                    // also keeps UNREACHED out of the addition below
                    if time_at_stop > self.cutoff_seconds {
                        continue;
                    }
                    if time_at_stop > *best {
                        continue;
                    }
                    let time_at_target = time_at_stop + egress_seconds;
                    if time_at_target < self.cutoff_seconds && time_at_target < *best {
                        *best = time_at_target;
                    }
                }
            }

            consumer.accept(target, &mut per_iteration)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UNREACHED;

    /// Captures raw per-iteration times before any reduction.
    #[derive(Default)]
    struct Recording {
        times: Vec<(usize, Vec<i32>)>,
        unvarying: Vec<(usize, i32)>,
    }

    impl PropagationConsumer for Recording {
        fn accept(&mut self, target: usize, seconds: &mut [i32]) -> Result<(), ReducerError> {
            self.times.push((target, seconds.to_vec()));
            Ok(())
        }

        fn accept_unvarying(&mut self, target: usize, seconds: i32) -> Result<(), ReducerError> {
            self.unvarying.push((target, seconds));
            Ok(())
        }
    }

    fn no_egress(n_targets: usize) -> EgressTables {
        EgressTables {
            stops_for_target: vec![Vec::new(); n_targets],
        }
    }

    #[test]
    fn transit_beats_street_when_faster() {
        // one stop, 10 iterations; stop reached at 200s only on iteration 7
        let mut tt = vec![vec![UNREACHED]; 10];
        tt[7][0] = 200;
        let non_transit = vec![600];
        let egress = EgressTables {
            // 390 meters at 1.3 m/s -> 300 s egress
            stops_for_target: vec![vec![(0, 390_000)]],
        };
        let propagator = PerTargetPropagator::new(&tt, &non_transit, &egress, 1.3, 3600, true);
        let mut out = Recording::default();
        propagator.propagate(&mut out).unwrap();
        let (_, times) = &out.times[0];
        assert_eq!(times[7], 500, "stop path 200+300 must beat street 600");
        assert!(times.iter().enumerate().all(|(i, &t)| i == 7 || t == 600));
    }

    #[test]
    fn updates_are_strictly_decreasing() {
        // two stops; the second is slower and must not overwrite the first
        let tt = vec![vec![100, 400]];
        let non_transit = vec![2000];
        let egress = EgressTables {
            stops_for_target: vec![vec![(0, 130_000), (1, 130_000)]], // 100s egress each
        };
        let propagator = PerTargetPropagator::new(&tt, &non_transit, &egress, 1.3, 3600, true);
        let mut out = Recording::default();
        propagator.propagate(&mut out).unwrap();
        assert_eq!(out.times[0].1, vec![200]);
    }

    #[test]
    fn times_at_or_past_cutoff_never_improve_a_target() {
        let tt = vec![vec![500]];
        let non_transit = vec![550];
        let egress = EgressTables {
            stops_for_target: vec![vec![(0, 130_000)]], // candidate 600 == cutoff
        };
        let propagator = PerTargetPropagator::new(&tt, &non_transit, &egress, 1.3, 600, true);
        let mut out = Recording::default();
        propagator.propagate(&mut out).unwrap();
        assert_eq!(out.times[0].1, vec![550]);
    }

    #[test]
    fn accessibility_only_short_circuits_street_reached_targets() {
        let tt = vec![vec![100], vec![100]];
        let non_transit = vec![300, 9000];
        let egress = EgressTables {
            stops_for_target: vec![Vec::new(), vec![(0, 130_000)]],
        };
        let propagator = PerTargetPropagator::new(&tt, &non_transit, &egress, 1.3, 600, false);
        let mut out = Recording::default();
        propagator.propagate(&mut out).unwrap();
        // target 0 skipped the scan, target 1 went through propagation
        assert_eq!(out.unvarying, vec![(0, 300)]);
        assert_eq!(out.times, vec![(1, vec![200, 200])]);
    }

    #[test]
    fn every_target_is_emitted_even_when_unreachable() {
        let tt: Vec<Vec<i32>> = vec![Vec::new()];
        let non_transit = vec![UNREACHED, UNREACHED];
        let egress = no_egress(2);
        let propagator =
            PerTargetPropagator::new(&tt, &non_transit, &egress, 1.3, 600, true);
        let mut out = Recording::default();
        propagator.propagate(&mut out).unwrap();
        assert_eq!(out.times.len(), 2);
        assert!(out.times.iter().all(|(_, t)| t == &vec![UNREACHED]));
    }

    #[test]
    fn ragged_input_is_rejected() {
        let tt = vec![vec![1, 2], vec![1]];
        let non_transit = vec![100];
        let egress = no_egress(1);
        let propagator =
            PerTargetPropagator::new(&tt, &non_transit, &egress, 1.3, 600, true);
        let mut out = Recording::default();
        assert!(matches!(
            propagator.propagate(&mut out),
            Err(PropagationError::RaggedStopMatrix { row: 1, .. })
        ));
    }
}
