//! Force, regularization and motion-term behavior inside controller steps.

use approx::assert_relative_eq;
use invtrack_control::prelude::*;
use invtrack_control::terms::{effector_response, EffectorResponse};
use invtrack_control::{ActuatorSet, ExcitationResponseModel, TermContext};
use invtrack_core::{Integrator, IntegratorChoice, MechModel, MotionConfig, RegularizationConfig};
use invtrack_test_utils::{
    damped_muscle_particle, pinned_muscle_particle, single_muscle_particle,
    unequal_planar_muscles, Fixture,
};
use nalgebra::{DVector, Vector3};

const H: f64 = 0.01;

fn controller(fx: &Fixture, config: ControllerConfig) -> TrackingController {
    let mut ctl = TrackingController::new(config).unwrap();
    for &e in &fx.exciters {
        ctl.add_exciter(&fx.sys, e, 1.0).unwrap();
    }
    ctl.add_motion_target(&fx.sys, fx.source, 1.0).unwrap();
    ctl
}

fn shift_point_target(ctl: &mut TrackingController, fx: &Fixture, shift: Vector3<f64>) {
    let SourcePose::Point(p) = fx.sys.source_pose(fx.source).unwrap() else {
        panic!("expected a point source");
    };
    ctl.set_motion_target_position(0, SourcePose::Point(p + shift))
        .unwrap();
}

fn applied(outcome: StepOutcome) -> DVector<f64> {
    match outcome {
        StepOutcome::Applied { excitations } => excitations,
        other => panic!("expected applied step, got {other:?}"),
    }
}

/// Effector prediction for the step `H -> 2H` with one actuator per exciter.
fn predict_effectors(fx: &mut Fixture, mode: ExcitationMode, static_only: bool) -> EffectorResponse {
    let mut set = ActuatorSet::new();
    for (i, &e) in fx.exciters.iter().enumerate() {
        set.add(Actuator::new(e, format!("a{i}"))).unwrap();
    }
    let excitations = set.read(&fx.sys).unwrap();
    let mut model = ExcitationResponseModel::new(IntegratorChoice::Auto);
    model
        .update(&mut fx.sys, &set, H, 2.0 * H, mode, None)
        .unwrap();
    let response = model.response().clone();
    let mut ctx = TermContext {
        t0: H,
        t1: 2.0 * H,
        h: H,
        mode,
        excitations: &excitations,
        response: &response,
        actuators: &set,
        model: &mut fx.sys,
    };
    effector_response(&mut ctx, &fx.effectors, static_only).unwrap()
}

// ---------------------------------------------------------------------------
// Effector forces
// ---------------------------------------------------------------------------

#[test]
fn effector_prediction_matches_next_step_tension() {
    for integrator in [Integrator::BackwardEuler, Integrator::Trapezoidal] {
        for a in [0.0, 0.3] {
            let mut fx = damped_muscle_particle(10.0, 50.0, 4.0, integrator);
            // Holistic predictions start from zero excitation regardless.
            fx.sys.set_excitation(fx.exciters[0], 0.7).unwrap();
            let er = predict_effectors(&mut fx, ExcitationMode::Holistic, false);
            assert_relative_eq!(fx.sys.excitation(fx.exciters[0]).unwrap(), 0.7);

            fx.sys.set_excitation(fx.exciters[0], a).unwrap();
            fx.sys.advance(H, 2.0 * H).unwrap();
            let tension = fx.sys.tension(fx.effectors[0]).unwrap();
            assert_relative_eq!(tension, er.f0[0] + er.hf[(0, 0)] * a, epsilon = 1e-9);
        }
    }
}

#[test]
fn incremental_effector_prediction_starts_from_current_excitation() {
    let mut fx = damped_muscle_particle(10.0, 50.0, 4.0, Integrator::BackwardEuler);
    fx.sys.set_excitation(fx.exciters[0], 0.5).unwrap();
    let er = predict_effectors(&mut fx, ExcitationMode::Incremental { delta: 1e-3 }, false);
    assert_relative_eq!(fx.sys.excitation(fx.exciters[0]).unwrap(), 0.5);

    fx.sys.set_excitation(fx.exciters[0], 0.7).unwrap();
    fx.sys.advance(H, 2.0 * H).unwrap();
    let tension = fx.sys.tension(fx.effectors[0]).unwrap();
    assert_relative_eq!(tension, er.f0[0] + er.hf[(0, 0)] * 0.2, epsilon = 1e-7);
}

#[test]
fn static_prediction_ignores_motion() {
    // Start-of-step tension is c * ldot = 4 * 0.5.
    let mut fx = damped_muscle_particle(10.0, 0.0, 4.0, Integrator::BackwardEuler);
    let er = predict_effectors(&mut fx, ExcitationMode::Holistic, true);
    assert_relative_eq!(er.f0[0], 2.0, epsilon = 1e-12);
    assert_relative_eq!(er.hf[(0, 0)], 10.0, epsilon = 1e-12);

    let dynamic = predict_effectors(&mut fx, ExcitationMode::Holistic, false);
    assert!(dynamic.hf[(0, 0)] < 10.0);
}

#[test]
fn effector_force_target_sets_muscle_tension() {
    for mode in [
        ExcitationMode::Holistic,
        ExcitationMode::Incremental { delta: 1e-3 },
    ] {
        let mut fx = pinned_muscle_particle(10.0);
        let config = ControllerConfig {
            mode,
            regularization: RegularizationConfig {
                l2: Some(1e-6),
                damping: None,
            },
            ..ControllerConfig::default()
        };
        let mut ctl = TrackingController::new(config).unwrap();
        ctl.add_exciter(&fx.sys, fx.exciters[0], 1.0).unwrap();

        let mut term = ForceEffectorTerm::new(1.0);
        let idx = term.add_force(&fx.sys, fx.effectors[0], 1.0).unwrap();
        term.set_target_force(idx, DVector::from_element(1, 2.0))
            .unwrap();
        ctl.add_cost_term(Box::new(term));

        let e = applied(ctl.apply(&mut fx.sys, H, 2.0 * H).unwrap());
        assert_relative_eq!(e[0], 0.2, epsilon = 1e-6);
        assert!(ctl.last_problem().q[(0, 0)] > 99.0);
        assert_relative_eq!(fx.sys.tension(fx.effectors[0]).unwrap(), 2.0, epsilon = 1e-4);
    }
}

#[test]
fn force_minimization_trades_off_tracking() {
    // Motion alone asks for 0.5. Minimizing (200 x)^2 at weight 1e-4 adds
    // 4 x^2 to (2 x - 1)^2, moving the optimum to 0.25.
    let mut fx = single_muscle_particle(200.0);
    let mut ctl = controller(&fx, ControllerConfig::default());
    ctl.add_cost_term(Box::new(ForceMinimizationTerm::new(fx.effectors.clone(), 1e-4)));
    shift_point_target(&mut ctl, &fx, Vector3::x() * H);

    let e = applied(ctl.apply(&mut fx.sys, H, 2.0 * H).unwrap());
    assert_relative_eq!(e[0], 0.25, epsilon = 1e-6);
}

// ---------------------------------------------------------------------------
// Regularization
// ---------------------------------------------------------------------------

#[test]
fn dynamic_regularization_penalizes_strong_actuator_less() {
    // Velocity columns (1, 0, 0) and (0, 0.5, 0): contributions 1 and 0.5.
    let mut fx = unequal_planar_muscles(100.0, 50.0);
    let mut ctl = controller(&fx, ControllerConfig::default());
    let id = ctl.add_cost_term(Box::new(DynamicRegularizationTerm::new(
        1.0,
        WeightMapping::Exponential { rate: 1.0 },
    )));
    shift_point_target(&mut ctl, &fx, Vector3::x() * (0.5 * H));

    let e = applied(ctl.apply(&mut fx.sys, H, 2.0 * H).unwrap());
    let g0 = (-1.0f64).exp();
    let g1 = (-0.5f64).exp();
    let weights = ctl
        .term::<DynamicRegularizationTerm>(id)
        .unwrap()
        .actuator_weights();
    assert_relative_eq!(weights[0], g0, epsilon = 1e-9);
    assert_relative_eq!(weights[1], g1, epsilon = 1e-9);

    let q = &ctl.last_problem().q;
    assert_relative_eq!(q[(0, 0)], 1.0 + g0, epsilon = 1e-9);
    assert_relative_eq!(q[(1, 1)], 0.25 + g1, epsilon = 1e-9);
    assert_relative_eq!(e[0], 0.5 / (1.0 + g0), epsilon = 1e-6);
    assert_relative_eq!(e[1], 0.0, epsilon = 1e-9);
}

#[test]
fn disabled_terms_match_terms_never_added() {
    let shift = Vector3::new(0.5 * H, 0.2 * H, 0.0);

    let mut fx_plain = unequal_planar_muscles(100.0, 50.0);
    let mut plain = controller(&fx_plain, ControllerConfig::default());
    shift_point_target(&mut plain, &fx_plain, shift);
    let expected = applied(plain.apply(&mut fx_plain.sys, H, 2.0 * H).unwrap());
    assert_relative_eq!(expected[0], 0.5, epsilon = 1e-6);
    assert_relative_eq!(expected[1], 0.4, epsilon = 1e-6);

    let mut fx = unequal_planar_muscles(100.0, 50.0);
    let mut ctl = controller(&fx, ControllerConfig::default());
    let reg = ctl.add_cost_term(Box::new(DynamicRegularizationTerm::new(
        10.0,
        WeightMapping::default(),
    )));
    let cap = ctl.add_constraint_term(Box::new(BoundsTerm::new(0.0, 0.3).unwrap()));
    ctl.set_term_enabled(reg, false);
    ctl.set_term_enabled(cap, false);
    shift_point_target(&mut ctl, &fx, shift);
    let e = applied(ctl.apply(&mut fx.sys, H, 2.0 * H).unwrap());

    assert_relative_eq!(e, expected, epsilon = 1e-12);
    assert_eq!(ctl.last_problem(), plain.last_problem());
}

// ---------------------------------------------------------------------------
// Motion term
// ---------------------------------------------------------------------------

#[test]
fn pd_target_velocity_follows_moving_target() {
    let mut fx = single_muscle_particle(200.0);
    let config = ControllerConfig {
        motion: MotionConfig {
            use_pd_control: true,
            kp: 0.5,
            kd: 1.0,
            ..MotionConfig::default()
        },
        ..ControllerConfig::default()
    };
    let mut ctl = controller(&fx, config);

    // First step: no previous target, v* = Kp/h * 0.008 = 0.4.
    shift_point_target(&mut ctl, &fx, Vector3::x() * (0.8 * H));
    let e = applied(ctl.apply(&mut fx.sys, H, 2.0 * H).unwrap());
    assert_relative_eq!(e[0], 0.2, epsilon = 1e-6);
    assert_relative_eq!(ctl.motion_term().velocity_error_norm(), 0.0);

    // The target moved 0.002 in one step: v_target = 0.2 and
    // v* = 0.5 * 1.0 + 1.0 * 0.2.
    shift_point_target(&mut ctl, &fx, Vector3::x() * H);
    let e = applied(ctl.apply(&mut fx.sys, 2.0 * H, 3.0 * H).unwrap());
    assert_relative_eq!(ctl.motion_targets()[0].target_velocity[0], 0.2, epsilon = 1e-9);
    assert_relative_eq!(ctl.motion_term().velocity_error_norm(), 0.2, epsilon = 1e-9);
    assert_relative_eq!(ctl.motion_term().position_error_norm(), H, epsilon = 1e-12);
    assert_relative_eq!(e[0], 0.35, epsilon = 1e-6);

    // A new session forgets the previous target.
    let e = applied(ctl.apply(&mut fx.sys, 0.0, H).unwrap());
    assert_relative_eq!(ctl.motion_targets()[0].target_velocity[0], 0.0);
    assert_relative_eq!(e[0], 0.25, epsilon = 1e-6);
}

#[test]
fn normalization_precedes_weights_and_step_scaling() {
    // Hv = (2, 0, 0) normalizes to (1, 0, 0).
    let cases = [(1.0, false, 1.0), (3.0, false, 9.0), (1.0, true, 1.0 / (H * H))];
    for (weight, timestep_scaling, q00) in cases {
        let mut fx = single_muscle_particle(200.0);
        let config = ControllerConfig {
            motion: MotionConfig {
                normalize_h: true,
                use_timestep_scaling: timestep_scaling,
                ..MotionConfig::default()
            },
            ..ControllerConfig::default()
        };
        let mut ctl = controller(&fx, config);
        ctl.set_motion_target_weights(&[weight]).unwrap();
        shift_point_target(&mut ctl, &fx, Vector3::x() * H);

        let e = applied(ctl.apply(&mut fx.sys, H, 2.0 * H).unwrap());
        assert_relative_eq!(ctl.last_problem().q[(0, 0)], q00, max_relative = 1e-9);
        assert_relative_eq!(e[0], 0.5, epsilon = 1e-6);
    }
}

#[test]
fn trapezoidal_controller_reaches_target_velocity() {
    // Starts at -0.5 m/s, so reaching 1 m/s takes 1.5 * 100 N.
    let mut fx = damped_muscle_particle(200.0, 0.0, 0.0, Integrator::Trapezoidal);
    let mut ctl = controller(&fx, ControllerConfig::default());
    shift_point_target(&mut ctl, &fx, Vector3::x() * H);

    let e = applied(ctl.apply(&mut fx.sys, H, 2.0 * H).unwrap());
    assert_eq!(ctl.response().integrator, Integrator::Trapezoidal);
    assert_relative_eq!(e[0], 0.75, epsilon = 1e-6);

    fx.sys.advance(H, 2.0 * H).unwrap();
    let v = fx.sys.source_velocity(fx.source).unwrap();
    assert_relative_eq!(v[0], 1.0, epsilon = 1e-5);
}
