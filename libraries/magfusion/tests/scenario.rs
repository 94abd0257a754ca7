#![cfg(feature = "simulation")]

use magfusion::simulation::{figure_eight_scenario, SimulatedSample, WristSimulator};
use magfusion::{
    CalibrationPhase, DecoratedSample, FusionMode, GeomagneticReference, Pipeline, PipelineConfig,
};

fn run_scenario(seed: u64) -> (Vec<SimulatedSample>, Vec<DecoratedSample>, Pipeline) {
    run_edited_scenario(seed, |_| {})
}

/// Run the figure-eight trace after letting `edit` tamper with the samples
fn run_edited_scenario(
    seed: u64,
    edit: impl FnOnce(&mut [SimulatedSample]),
) -> (Vec<SimulatedSample>, Vec<DecoratedSample>, Pipeline) {
    let simulation = figure_eight_scenario(seed);
    let mut pipeline =
        Pipeline::new(PipelineConfig::default(), simulation.reference).expect("valid config");
    let mut truth: Vec<SimulatedSample> = WristSimulator::new(simulation).collect();
    edit(&mut truth);
    let outputs = truth
        .iter()
        .map(|s| pipeline.process(&s.sample).expect("valid sample"))
        .collect();
    (truth, outputs, pipeline)
}

#[test]
fn gyro_bias_converges_while_resting() {
    let (_, outputs, _) = run_scenario(7);
    let true_bias = figure_eight_scenario(7).gyro_bias_dps;
    let error = (outputs[50].gyro_bias_dps - true_bias).norm() / true_bias.norm();
    assert!(error < 0.1, "bias error {:.3} at sample 50", error);
    assert!(!outputs[50].motion.is_moving);
    assert!(outputs[300].motion.is_moving);
}

#[test]
fn quaternion_stays_normalized() {
    let (_, outputs, _) = run_scenario(7);
    for out in &outputs {
        assert!((out.orientation.quaternion().norm() - 1.0).abs() < 1e-6);
    }
}

#[test]
fn calibration_refines_during_figure_eight() {
    let (_, outputs, pipeline) = run_scenario(7);
    assert_eq!(outputs[0].calibration.phase, CalibrationPhase::Bootstrap);
    assert_eq!(outputs[0].fusion_mode, FusionMode::SixDof);

    let refined_at = outputs
        .iter()
        .position(|o| o.calibration.phase == CalibrationPhase::Refined)
        .expect("refinement accepted");
    assert!(refined_at > 200 && refined_at < 700, "refined at {}", refined_at);
    assert!(outputs[refined_at].calibration_event.is_some());
    assert_eq!(outputs[650].fusion_mode, FusionMode::NineDof);

    let state = pipeline.calibration_state();
    let quality = state.quality.expect("quality metrics");
    assert!(quality.residual_rms_ut < 3.0);
    assert!(quality.coverage_deg >= 30.0);
    assert!(state.last_failure.is_none());
}

fn earth_ready_at(outputs: &[DecoratedSample]) -> usize {
    let ready_at = outputs
        .iter()
        .position(|o| o.earth_field_ready)
        .expect("earth estimate ready");
    for (index, out) in outputs.iter().enumerate().skip(ready_at) {
        assert!(out.earth_field_ready, "earth readiness lost at sample {}", index);
    }
    ready_at
}

#[test]
fn earth_field_ready_by_sample_400_and_through_refinement() {
    let (_, outputs, pipeline) = run_scenario(7);
    let ready_at = earth_ready_at(&outputs);
    assert!(ready_at <= 400, "earth first ready at sample {}", ready_at);
    let refined_at = outputs
        .iter()
        .position(|o| o.calibration.phase == CalibrationPhase::Refined)
        .expect("refinement accepted");
    assert!(refined_at > ready_at);

    let earth = pipeline.earth_estimate().expect("earth estimate");
    let reference = GeomagneticReference::default().world_vector();
    // Heading is referenced to the measured field, so compare magnitude and dip
    assert!((earth.world_field_ut.norm() - reference.norm()).abs() < 3.0);
    let dip = (-earth.world_field_ut.z).atan2(earth.world_field_ut.xy().norm());
    let reference_dip = (-reference.z).atan2(reference.xy().norm());
    assert!((dip - reference_dip).abs().to_degrees() < 5.0);
}

#[test]
fn clean_residual_before_magnet() {
    let (_, outputs, _) = run_scenario(7);
    for out in &outputs[700..750] {
        let residual = out.residual_magnitude_ut.expect("residual");
        assert!(residual < 15.0, "residual {:.2} uT at {} ms", residual, out.timestamp_ms);
        assert!(out.confident);
        assert!(!out.magnetic_anomaly);
    }
}

#[test]
fn magnet_shows_up_in_residual() {
    let (truth, outputs, _) = run_scenario(7);
    let delta = truth[999].true_residual_ut;
    for (sample, out) in truth[950..].iter().zip(&outputs[950..]) {
        let residual = out.residual_ut.expect("residual");
        assert!(residual.norm() > delta.norm() - 10.0);
        assert!((residual - sample.true_residual_ut).norm() < 10.0);
        assert!(out.magnetic_anomaly);
        // The magnet must not drag heading around
        assert!(out.orientation.angle_to(&sample.true_attitude).to_degrees() < 10.0);
    }
    assert!(outputs[850..].iter().all(|o| o.magnetic_anomaly));
}

#[test]
fn other_seeds_behave_alike() {
    for seed in [1, 2, 11] {
        let (_, outputs, _) = run_scenario(seed);
        assert_eq!(outputs[999].calibration.phase, CalibrationPhase::Refined);
        let ready_at = earth_ready_at(&outputs);
        assert!(ready_at <= 400, "seed {}: earth first ready at sample {}", seed, ready_at);
        assert!(outputs[720].residual_magnitude_ut.expect("residual") < 15.0);
        assert!(outputs[980].residual_magnitude_ut.expect("residual") > 40.0);
    }
}

#[test]
fn spike_on_first_sample_does_not_block_calibration() {
    let (_, outputs, pipeline) = run_edited_scenario(7, |truth| {
        truth[0].sample.mag_ut.x += 400.0;
    });
    assert!(outputs[0].residual_ut.is_none());
    assert_eq!(outputs[999].calibration.phase, CalibrationPhase::Refined);
    assert!(earth_ready_at(&outputs) <= 400);
    assert!(outputs[720].residual_magnitude_ut.expect("residual") < 15.0);
    assert!(pipeline.calibration_state().last_failure.is_none());
}
