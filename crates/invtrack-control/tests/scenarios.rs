//! End-to-end controller steps on small reference systems.

use approx::assert_relative_eq;
use invtrack_control::prelude::*;
use invtrack_core::{ControlError, MechModel, QpError, QpStatus};
use invtrack_mech::frame_pose;
use invtrack_test_utils::{
    frame_with_markers, pinned_muscle_particle, single_muscle_particle, FailingQpSolver, Fixture,
    ScriptedQpSolver,
};
use nalgebra::{DVector, Vector3};

const H: f64 = 0.01;

/// Controller driving every exciter of `fx`, tracking its source.
fn controller(fx: &Fixture, config: ControllerConfig) -> TrackingController {
    let mut ctl = TrackingController::new(config).unwrap();
    for &e in &fx.exciters {
        ctl.add_exciter(&fx.sys, e, 1.0).unwrap();
    }
    ctl.add_motion_target(&fx.sys, fx.source, 1.0).unwrap();
    ctl
}

/// Move the point target `dx` along x from the current position.
fn shift_point_target(ctl: &mut TrackingController, fx: &Fixture, dx: f64) {
    let SourcePose::Point(p) = fx.sys.source_pose(fx.source).unwrap() else {
        panic!("expected a point source");
    };
    ctl.set_motion_target_position(0, SourcePose::Point(p + Vector3::x() * dx))
        .unwrap();
}

fn applied(outcome: StepOutcome) -> DVector<f64> {
    match outcome {
        StepOutcome::Applied { excitations } => excitations,
        other => panic!("expected applied step, got {other:?}"),
    }
}

#[test]
fn single_muscle_reaches_exact_excitation() {
    let mut fx = single_muscle_particle(200.0);
    let mut ctl = controller(&fx, ControllerConfig::default());
    shift_point_target(&mut ctl, &fx, H);

    let e = applied(ctl.apply(&mut fx.sys, H, 2.0 * H).unwrap());
    assert_relative_eq!(e[0], 0.5, epsilon = 1e-6);
    assert_relative_eq!(fx.sys.excitation(fx.exciters[0]).unwrap(), 0.5, epsilon = 1e-6);

    fx.sys.advance(H, 2.0 * H).unwrap();
    let v = fx.sys.source_velocity(fx.source).unwrap();
    assert_relative_eq!(v[0], 1.0, epsilon = 1e-5);
}

#[test]
fn incremental_mode_matches_holistic() {
    let mut fx = single_muscle_particle(200.0);
    let config = ControllerConfig {
        mode: ExcitationMode::Incremental { delta: 1e-3 },
        ..ControllerConfig::default()
    };
    let mut ctl = controller(&fx, config);
    shift_point_target(&mut ctl, &fx, H);

    let e = applied(ctl.apply(&mut fx.sys, H, 2.0 * H).unwrap());
    assert_relative_eq!(e[0], 0.5, epsilon = 1e-6);
}

#[test]
fn weak_muscle_saturates_at_upper_bound() {
    let mut fx = single_muscle_particle(50.0);
    let mut ctl = controller(&fx, ControllerConfig::default());
    shift_point_target(&mut ctl, &fx, H);

    let e = applied(ctl.apply(&mut fx.sys, H, 2.0 * H).unwrap());
    assert_relative_eq!(e[0], 1.0, epsilon = 1e-6);
}

#[test]
fn zero_upper_bound_forces_zero_excitation() {
    let mut fx = single_muscle_particle(200.0);
    let mut ctl = controller(&fx, ControllerConfig::default());
    ctl.set_excitation_bounds(0.0, 0.0).unwrap();
    shift_point_target(&mut ctl, &fx, H);

    let e = applied(ctl.apply(&mut fx.sys, H, 2.0 * H).unwrap());
    assert_relative_eq!(e[0], 0.0, epsilon = 1e-6);
}

#[test]
fn stationary_target_needs_no_excitation() {
    let mut fx = single_muscle_particle(200.0);
    let mut ctl = controller(&fx, ControllerConfig::default());

    let e = applied(ctl.apply(&mut fx.sys, H, 2.0 * H).unwrap());
    assert_relative_eq!(e[0], 0.0, epsilon = 1e-12);
}

#[test]
fn disabled_constraint_term_drops_its_rows() {
    let mut fx = single_muscle_particle(200.0);
    let mut ctl = controller(&fx, ControllerConfig::default());
    let cap = ctl.add_constraint_term(Box::new(BoundsTerm::new(0.0, 0.3).unwrap()));
    shift_point_target(&mut ctl, &fx, H);

    let capped = applied(ctl.apply(&mut fx.sys, H, 2.0 * H).unwrap());
    assert_relative_eq!(capped[0], 0.3, epsilon = 1e-6);
    assert_eq!(ctl.last_problem().num_inequalities(), 4);

    ctl.set_term_enabled(cap, false);
    let free = applied(ctl.apply(&mut fx.sys, H, 2.0 * H).unwrap());
    assert_relative_eq!(free[0], 0.5, epsilon = 1e-6);
    assert_eq!(ctl.last_problem().num_inequalities(), 2);
}

#[test]
fn cost_scales_linearly_with_term_weight() {
    let mut fx = single_muscle_particle(200.0);
    let mut ctl = controller(&fx, ControllerConfig::default());
    shift_point_target(&mut ctl, &fx, H);

    let first = applied(ctl.apply(&mut fx.sys, H, 2.0 * H).unwrap());
    let q1 = ctl.last_problem().q.clone();
    let p1 = ctl.last_problem().p.clone();

    ctl.set_motion_target_weight(3.0);
    let second = applied(ctl.apply(&mut fx.sys, H, 2.0 * H).unwrap());
    assert_relative_eq!(ctl.last_problem().q, q1 * 3.0, epsilon = 1e-9);
    assert_relative_eq!(ctl.last_problem().p, p1 * 3.0, epsilon = 1e-9);
    assert_relative_eq!(first, second, epsilon = 1e-6);
}

#[test]
fn failed_solve_keeps_previous_excitations() {
    let mut fx = single_muscle_particle(200.0);
    let mut ctl = TrackingController::with_solver(
        ControllerConfig::default(),
        Box::new(FailingQpSolver::default()),
    )
    .unwrap();
    let h = ctl.add_exciter(&fx.sys, fx.exciters[0], 1.0).unwrap();
    ctl.set_actuator_bounds(h, 0.0, 1.0).unwrap();
    ctl.add_motion_target(&fx.sys, fx.source, 1.0).unwrap();
    fx.sys.set_excitation(fx.exciters[0], 0.4).unwrap();
    ctl.initialize_excitations(&fx.sys).unwrap();
    shift_point_target(&mut ctl, &fx, H);

    let outcome = ctl.apply(&mut fx.sys, H, 2.0 * H).unwrap();
    assert!(matches!(
        outcome,
        StepOutcome::Retained {
            reason: ControlError::Qp(QpError::NotSolved(QpStatus::MaxIterations))
        }
    ));
    assert_relative_eq!(ctl.excitations()[0], 0.4);
    assert_relative_eq!(fx.sys.excitation(fx.exciters[0]).unwrap(), 0.4);
}

#[test]
fn session_start_restores_initial_excitations() {
    let mut fx = single_muscle_particle(200.0);
    let mut ctl = TrackingController::with_solver(
        ControllerConfig::default(),
        Box::new(FailingQpSolver::default()),
    )
    .unwrap();
    ctl.add_exciter(&fx.sys, fx.exciters[0], 1.0).unwrap();
    ctl.set_initial_excitations(&[0.2]).unwrap();
    fx.sys.set_excitation(fx.exciters[0], 0.9).unwrap();

    let outcome = ctl.apply(&mut fx.sys, 0.0, H).unwrap();
    assert!(!outcome.is_applied());
    assert_relative_eq!(ctl.excitations()[0], 0.2);
    assert_relative_eq!(fx.sys.excitation(fx.exciters[0]).unwrap(), 0.2);
}

#[test]
fn disabled_controller_skips() {
    let mut fx = single_muscle_particle(200.0);
    let mut ctl = controller(&fx, ControllerConfig::default());
    ctl.set_enabled(false);
    assert!(matches!(
        ctl.apply(&mut fx.sys, H, 2.0 * H).unwrap(),
        StepOutcome::Skipped
    ));
    assert!(ctl.apply(&mut fx.sys, 2.0 * H, H).is_ok());
}

#[test]
fn backwards_step_is_rejected() {
    let mut fx = single_muscle_particle(200.0);
    let mut ctl = controller(&fx, ControllerConfig::default());
    assert!(matches!(
        ctl.apply(&mut fx.sys, 2.0 * H, H),
        Err(ControlError::Config(_))
    ));
}

#[test]
fn governor_limits_excitation_jump() {
    let mut fx = single_muscle_particle(200.0);
    let config = ControllerConfig {
        max_excitation_jump: 0.1,
        enforce_max_excitation_jump: true,
        ..ControllerConfig::default()
    };
    let solver = ScriptedQpSolver::new([DVector::from_element(1, 1.0), DVector::from_element(1, 1.0)]);
    let mut ctl = TrackingController::with_solver(config, Box::new(solver)).unwrap();
    ctl.add_exciter(&fx.sys, fx.exciters[0], 1.0).unwrap();

    let e = applied(ctl.apply(&mut fx.sys, H, 2.0 * H).unwrap());
    assert_relative_eq!(e[0], 0.1, epsilon = 1e-12);
    let e = applied(ctl.apply(&mut fx.sys, 2.0 * H, 3.0 * H).unwrap());
    assert_relative_eq!(e[0], 0.2, epsilon = 1e-12);
}

#[test]
fn pinned_particle_tracks_reaction_force() {
    let mut fx = pinned_muscle_particle(10.0);
    let mut ctl = TrackingController::new(ControllerConfig::default()).unwrap();
    ctl.add_exciter(&fx.sys, fx.exciters[0], 1.0).unwrap();

    let mut term = ForceTargetTerm::new(1.0);
    let idx = term.add_force(&fx.sys, fx.connectors[0], 1.0).unwrap();
    term.set_target_force(idx, DVector::from_column_slice(&[-3.0, 0.0, 0.0]))
        .unwrap();
    let id = ctl.add_cost_term(Box::new(term));

    let e = applied(ctl.apply(&mut fx.sys, H, 2.0 * H).unwrap());
    assert_relative_eq!(e[0], 0.3, epsilon = 1e-6);
    assert_eq!(ctl.term::<ForceTargetTerm>(id).unwrap().num_rows(), 3);
}

#[test]
fn frame_tracking_balances_both_muscles() {
    let mut fx = frame_with_markers(100.0);
    let mut ctl = controller(&fx, ControllerConfig::default());
    // 0.5 m/s upward needs 50 N in total, shared evenly to cancel the torque.
    let target = frame_pose(Vector3::new(0.0, 0.5 * H, 0.0), Vector3::zeros());
    ctl.set_motion_target_position(0, SourcePose::Frame(target))
        .unwrap();

    let e = applied(ctl.apply(&mut fx.sys, H, 2.0 * H).unwrap());
    assert_relative_eq!(e[0], e[1], epsilon = 1e-6);
    assert_relative_eq!(e[0], 0.25, epsilon = 1e-5);

    fx.sys.advance(H, 2.0 * H).unwrap();
    let v = fx.sys.source_velocity(fx.source).unwrap();
    assert_relative_eq!(v[1], 0.5, epsilon = 1e-4);
    assert_relative_eq!(v[5], 0.0, epsilon = 1e-6);
}

#[test]
fn motion_constraint_mode_hits_target_velocity() {
    let mut fx = single_muscle_particle(200.0);
    let config = ControllerConfig {
        motion_as_constraint: true,
        ..ControllerConfig::default()
    };
    let mut ctl = TrackingController::new(config).unwrap();
    ctl.add_exciter(&fx.sys, fx.exciters[0], 1.0).unwrap();
    // Only the x row is controllable, so track x alone.
    ctl.add_motion_target(&fx.sys, fx.source, 1.0).unwrap();
    ctl.set_motion_target_weights(&[1.0, 0.0, 0.0]).unwrap();
    shift_point_target(&mut ctl, &fx, 0.4 * H);

    let e = applied(ctl.apply(&mut fx.sys, H, 2.0 * H).unwrap());
    assert_relative_eq!(e[0], 0.2, epsilon = 1e-6);
    assert_eq!(ctl.last_problem().num_equalities(), 3);
}
