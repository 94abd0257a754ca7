use nalgebra as na;

use super::IronCorrection;

/// Readings that must agree before the outlier test has a centre of its own
pub(crate) const ANCHOR_QUORUM: usize = 5;

/// Consecutive rejections after which an incomplete bootstrap starts over
pub(crate) const REANCHOR_AFTER: usize = 50;

/// What happened to one raw reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Observation {
    /// Folded into the running extremes
    Accepted,
    /// Held back until a quorum of readings agrees on a centre
    Pending,
    /// Too far from the working centre
    Rejected,
    /// Too many rejections in a row: extremes and seed were dropped and a new
    /// quorum started with this reading
    Restarted,
}

/// Instantaneous hard/soft iron estimate from per-axis extremes.
///
/// Progress only counts samples actually observed this session. Seeded bounds
/// from an earlier session stand in for an axis until that axis has covered
/// its target span, and they centre the outlier test before any data arrives.
/// Without a seed the first readings are held until [`ANCHOR_QUORUM`] of them
/// exist, and the per-axis median of that group becomes the first centre, so a
/// spike at session start cannot lock out every later reading.
#[derive(Debug, Clone)]
pub(crate) struct Bootstrap {
    expected_range: f64,
    range_fraction: f64,
    outlier_threshold: f64,
    min: na::Vector3<f64>,
    max: na::Vector3<f64>,
    observed: usize,
    outliers: usize,
    rejected_run: usize,
    pending: Vec<na::Vector3<f64>>,
    seed: Option<(na::Vector3<f64>, na::Vector3<f64>)>,
}

impl Bootstrap {
    pub(crate) fn new(expected_range: f64, range_fraction: f64, outlier_threshold: f64) -> Self {
        Self {
            expected_range,
            range_fraction,
            outlier_threshold,
            min: na::Vector3::repeat(f64::INFINITY),
            max: na::Vector3::repeat(f64::NEG_INFINITY),
            observed: 0,
            outliers: 0,
            rejected_run: 0,
            pending: Vec::with_capacity(ANCHOR_QUORUM),
            seed: None,
        }
    }

    /// Seed per-axis bounds from a previous session's correction
    pub(crate) fn seed_from(&mut self, correction: &IronCorrection) {
        let mut min = na::Vector3::zeros();
        let mut max = na::Vector3::zeros();
        for axis in 0..3 {
            let scale = correction.soft_iron[(axis, axis)].abs().max(1e-6);
            let half_span = 0.5 * self.expected_range / scale;
            min[axis] = correction.hard_iron_ut[axis] - half_span;
            max[axis] = correction.hard_iron_ut[axis] + half_span;
        }
        self.seed = Some((min, max));
    }

    pub(crate) fn is_seeded(&self) -> bool {
        self.seed.is_some()
    }

    /// Fold in a raw reading
    pub(crate) fn observe(&mut self, raw: &na::Vector3<f64>) -> Observation {
        let Some((low, high)) = self.bounds() else {
            return self.anchor(raw);
        };
        let centre = (low + high) * 0.5;
        if self.is_inlier(raw, &centre) {
            self.admit(raw);
            return Observation::Accepted;
        }

        self.outliers += 1;
        self.rejected_run += 1;
        if self.rejected_run >= REANCHOR_AFTER && !self.is_complete() {
            self.restart();
            self.pending.push(*raw);
            return Observation::Restarted;
        }
        Observation::Rejected
    }

    fn is_inlier(&self, raw: &na::Vector3<f64>, centre: &na::Vector3<f64>) -> bool {
        (raw - centre).amax() <= self.outlier_threshold
    }

    fn admit(&mut self, raw: &na::Vector3<f64>) {
        self.min = self.min.inf(raw);
        self.max = self.max.sup(raw);
        self.observed += 1;
        self.rejected_run = 0;
    }

    /// Hold readings until a quorum exists, then admit those near its median
    fn anchor(&mut self, raw: &na::Vector3<f64>) -> Observation {
        self.pending.push(*raw);
        if self.pending.len() < ANCHOR_QUORUM {
            return Observation::Pending;
        }

        let pending = std::mem::take(&mut self.pending);
        let centre = na::Vector3::from_fn(|axis, _| {
            let mut values: Vec<f64> = pending.iter().map(|p| p[axis]).collect();
            values.sort_by(f64::total_cmp);
            values[values.len() / 2]
        });
        for sample in &pending {
            if self.is_inlier(sample, &centre) {
                self.admit(sample);
            } else {
                self.outliers += 1;
            }
        }

        if self.is_inlier(raw, &centre) {
            Observation::Accepted
        } else {
            Observation::Rejected
        }
    }

    fn restart(&mut self) {
        self.min = na::Vector3::repeat(f64::INFINITY);
        self.max = na::Vector3::repeat(f64::NEG_INFINITY);
        self.observed = 0;
        self.rejected_run = 0;
        self.pending.clear();
        self.seed = None;
    }

    pub(crate) fn observed(&self) -> usize {
        self.observed
    }

    pub(crate) fn outliers(&self) -> usize {
        self.outliers
    }

    fn observed_range(&self) -> na::Vector3<f64> {
        if self.observed == 0 {
            na::Vector3::zeros()
        } else {
            self.max - self.min
        }
    }

    /// Per-axis progress toward the target span, each in [0, 1]
    pub(crate) fn axis_progress(&self) -> na::Vector3<f64> {
        let target = self.range_fraction * self.expected_range;
        self.observed_range().map(|range| (range / target).clamp(0.0, 1.0))
    }

    /// Mean of the per-axis progress
    pub(crate) fn progress(&self) -> f64 {
        self.axis_progress().mean()
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.axis_progress().iter().all(|p| *p >= 1.0)
    }

    /// Ratio of smallest to largest observed axis span
    pub(crate) fn observed_sphericity(&self) -> f64 {
        let range = self.observed_range();
        let largest = range.max();
        if largest <= 0.0 {
            0.0
        } else {
            range.min() / largest
        }
    }

    /// Confidence in the Phase A estimate, capped at one half
    pub(crate) fn confidence(&self) -> f64 {
        0.5 * self.progress() * self.observed_sphericity()
    }

    /// Working bounds: observed spans where complete, seeded spans elsewhere
    fn bounds(&self) -> Option<(na::Vector3<f64>, na::Vector3<f64>)> {
        match (self.observed, self.seed) {
            (0, None) => None,
            (0, Some(seed)) => Some(seed),
            (_, None) => Some((self.min, self.max)),
            (_, Some((seed_min, seed_max))) => {
                let progress = self.axis_progress();
                let mut min = self.min;
                let mut max = self.max;
                for axis in 0..3 {
                    if progress[axis] < 1.0 {
                        min[axis] = seed_min[axis];
                        max[axis] = seed_max[axis];
                    }
                }
                Some((min, max))
            }
        }
    }

    /// Diagonal correction from the working bounds.
    ///
    /// Without a seed this is only available once every axis is complete.
    pub(crate) fn correction(&self) -> Option<IronCorrection> {
        if !self.is_complete() && !self.is_seeded() {
            return None;
        }
        let (min, max) = self.bounds()?;
        let hard_iron_ut = (min + max) * 0.5;
        let scale = (max - min).map(|range| (self.expected_range / range.max(1e-6)).clamp(0.5, 2.0));
        Some(IronCorrection {
            hard_iron_ut,
            soft_iron: na::Matrix3::from_diagonal(&scale),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2 * |(20, 0, -45)|
    const EXPECTED_RANGE: f64 = 98.4886;

    fn bootstrap() -> Bootstrap {
        Bootstrap::new(EXPECTED_RANGE, 0.5, 150.0)
    }

    fn sphere_point(offset: &na::Vector3<f64>, radius: f64, theta: f64, phi: f64) -> na::Vector3<f64> {
        offset
            + na::Vector3::new(
                radius * theta.sin() * phi.cos(),
                radius * theta.sin() * phi.sin(),
                radius * theta.cos(),
            )
    }

    #[test]
    fn completes_after_full_rotation() {
        let offset = na::Vector3::new(30.0, -10.0, 5.0);
        let mut phase_a = bootstrap();
        assert!(phase_a.correction().is_none());
        for i in 0..40 {
            for j in 0..20 {
                let theta = std::f64::consts::PI * j as f64 / 19.0;
                let phi = 2.0 * std::f64::consts::PI * i as f64 / 40.0;
                let observation = phase_a.observe(&sphere_point(&offset, 49.0, theta, phi));
                assert_ne!(observation, Observation::Rejected);
            }
        }
        assert!(phase_a.is_complete());
        let correction = phase_a.correction().unwrap();
        assert!((correction.hard_iron_ut - offset).norm() < 0.5);
        for axis in 0..3 {
            assert!((correction.soft_iron[(axis, axis)] - 1.005).abs() < 0.02);
        }
        assert!(phase_a.observed_sphericity() > 0.95);
        assert!(phase_a.confidence() <= 0.5);
    }

    #[test]
    fn rejects_spikes_far_from_centre() {
        let mut phase_a = bootstrap();
        for i in 0..ANCHOR_QUORUM {
            let reading = na::Vector3::new(10.0 + i as f64, 10.0, 10.0);
            let expected = if i + 1 < ANCHOR_QUORUM {
                Observation::Pending
            } else {
                Observation::Accepted
            };
            assert_eq!(phase_a.observe(&reading), expected);
        }
        assert_eq!(
            phase_a.observe(&na::Vector3::new(10.0, 400.0, 10.0)),
            Observation::Rejected
        );
        assert_eq!(phase_a.outliers(), 1);
        assert_eq!(phase_a.observed(), ANCHOR_QUORUM);
    }

    #[test]
    fn spike_on_first_reading_is_outvoted() {
        let offset = na::Vector3::new(28.0, -17.0, 42.0);
        let mut phase_a = bootstrap();
        let spike = offset + na::Vector3::new(420.0, 0.0, -45.0);
        assert_eq!(phase_a.observe(&spike), Observation::Pending);

        let mut results = Vec::new();
        for i in 0..40 {
            for j in 0..20 {
                let theta = std::f64::consts::PI * j as f64 / 19.0;
                let phi = 2.0 * std::f64::consts::PI * i as f64 / 40.0;
                results.push(phase_a.observe(&sphere_point(&offset, 49.0, theta, phi)));
            }
        }
        assert!(!results.contains(&Observation::Rejected));
        assert_eq!(phase_a.outliers(), 1);
        assert!(phase_a.is_complete());
        let correction = phase_a.correction().unwrap();
        assert!((correction.hard_iron_ut - offset).norm() < 0.5);
    }

    #[test]
    fn quorum_admits_only_readings_near_its_median() {
        let mut phase_a = bootstrap();
        for i in 0..ANCHOR_QUORUM {
            // Readings 400 uT apart; only the median itself is within the threshold
            let reading = na::Vector3::repeat(400.0 * i as f64);
            phase_a.observe(&reading);
        }
        assert_eq!(phase_a.observed(), 1);
        assert_eq!(phase_a.outliers(), ANCHOR_QUORUM - 1);
    }

    #[test]
    fn wrong_seed_is_dropped_after_repeated_rejections() {
        let wrong = IronCorrection {
            hard_iron_ut: na::Vector3::new(400.0, 0.0, 0.0),
            soft_iron: na::Matrix3::identity(),
        };
        let offset = na::Vector3::new(28.0, -17.0, 42.0);
        let mut phase_a = bootstrap();
        phase_a.seed_from(&wrong);

        let reading = |i: usize| {
            let phi = i as f64 * 0.2;
            offset + na::Vector3::new(49.0 * phi.cos(), 49.0 * phi.sin(), 0.0)
        };
        for i in 0..REANCHOR_AFTER - 1 {
            assert_eq!(phase_a.observe(&reading(i)), Observation::Rejected);
        }
        assert_eq!(phase_a.observe(&reading(REANCHOR_AFTER)), Observation::Restarted);
        assert!(!phase_a.is_seeded());
        assert!(phase_a.correction().is_none());

        let accepted = (0..200)
            .map(|i| phase_a.observe(&reading(i)))
            .filter(|o| *o == Observation::Accepted)
            .count();
        assert!(accepted >= 195, "only {} readings accepted", accepted);
        assert!(phase_a.axis_progress().x >= 1.0);
    }

    #[test]
    fn seed_never_advances_progress() {
        let seed = IronCorrection {
            hard_iron_ut: na::Vector3::new(28.0, -17.0, 42.0),
            soft_iron: na::Matrix3::identity(),
        };
        let mut phase_a = bootstrap();
        phase_a.seed_from(&seed);
        assert_eq!(phase_a.progress(), 0.0);
        assert!(!phase_a.is_complete());

        // Provisional correction comes from the seed before anything is observed
        let provisional = phase_a.correction().unwrap();
        assert!((provisional.hard_iron_ut - seed.hard_iron_ut).norm() < 1e-9);

        // A narrow wobble moves progress but cannot complete
        for i in 0..50 {
            let wobble = 5.0 * (i as f64 * 0.3).sin();
            phase_a.observe(&(seed.hard_iron_ut + na::Vector3::new(20.0 + wobble, wobble, -45.0)));
        }
        assert!(phase_a.progress() > 0.0);
        assert!(phase_a.progress() < 1.0);
        assert!(!phase_a.is_complete());
    }

    #[test]
    fn seed_centres_outlier_test() {
        let seed = IronCorrection {
            hard_iron_ut: na::Vector3::new(200.0, 0.0, 0.0),
            soft_iron: na::Matrix3::identity(),
        };
        let mut phase_a = bootstrap();
        phase_a.seed_from(&seed);
        assert_eq!(phase_a.observe(&na::Vector3::new(0.0, 0.0, 0.0)), Observation::Rejected);
        assert_eq!(
            phase_a.observe(&na::Vector3::new(190.0, 20.0, -40.0)),
            Observation::Accepted
        );
    }
}
