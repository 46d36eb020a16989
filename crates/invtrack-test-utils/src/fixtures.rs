//! Small reference systems used across test suites.

use invtrack_core::{ConnectorId, EffectorId, ExciterId, Integrator, MotionSource};
use invtrack_mech::{frame_pose, Actuation, Frame, MassSpringSystem, Particle};
use nalgebra::Vector3;

/// A built system together with the handles tests need.
#[derive(Clone, Debug)]
pub struct Fixture {
    pub sys: MassSpringSystem,
    /// Component to track.
    pub source: MotionSource,
    pub exciters: Vec<ExciterId>,
    pub effectors: Vec<EffectorId>,
    pub connectors: Vec<ConnectorId>,
}

/// Unit-mass particle at the origin pulled toward an anchor at `(1, 0, 0)`
/// by one muscle. No gravity, no passive forces.
pub fn single_muscle_particle(max_force: f64) -> Fixture {
    let mut sys = MassSpringSystem::new();
    let p = sys.add_particle(Particle::new(1.0, Vector3::zeros()));
    let anchor = sys.add_anchor(Vector3::x());
    let (effector, exciter) = sys.add_simple_muscle("x", p, anchor, max_force).unwrap();
    Fixture {
        sys,
        source: MotionSource::Point(p),
        exciters: vec![exciter],
        effectors: vec![effector],
        connectors: Vec::new(),
    }
}

/// Like [`single_muscle_particle`], with passive `stiffness` and `damping`
/// on the muscle. The particle starts at `-0.5` m/s along x, lengthening the
/// muscle.
pub fn damped_muscle_particle(
    max_force: f64,
    stiffness: f64,
    damping: f64,
    integrator: Integrator,
) -> Fixture {
    let mut sys = MassSpringSystem::new().with_integrator(integrator);
    let p = sys.add_particle(Particle::new(1.0, Vector3::zeros()));
    let anchor = sys.add_anchor(Vector3::x());
    let (effector, exciter) = sys.add_simple_muscle("x", p, anchor, max_force).unwrap();
    let muscle = sys.effector_mut(effector).unwrap();
    muscle.stiffness = stiffness;
    muscle.damping = damping;
    sys.set_point_velocity(p, Vector3::new(-0.5, 0.0, 0.0)).unwrap();
    Fixture {
        sys,
        source: MotionSource::Point(p),
        exciters: vec![exciter],
        effectors: vec![effector],
        connectors: Vec::new(),
    }
}

/// Unit-mass particle at the origin with muscles toward `+x` and `+y`.
pub fn planar_two_muscle(max_force: f64) -> Fixture {
    let mut sys = MassSpringSystem::new();
    let p = sys.add_particle(Particle::new(1.0, Vector3::zeros()));
    let ax = sys.add_anchor(Vector3::x());
    let ay = sys.add_anchor(Vector3::y());
    let (ex, cx) = sys.add_simple_muscle("x", p, ax, max_force).unwrap();
    let (ey, cy) = sys.add_simple_muscle("y", p, ay, max_force).unwrap();
    Fixture {
        sys,
        source: MotionSource::Point(p),
        exciters: vec![cx, cy],
        effectors: vec![ex, ey],
        connectors: Vec::new(),
    }
}

/// Planar particle with a muscle of `strong` newtons toward `+x` and one of
/// `weak` newtons toward `+y`.
pub fn unequal_planar_muscles(strong: f64, weak: f64) -> Fixture {
    let mut sys = MassSpringSystem::new();
    let p = sys.add_particle(Particle::new(1.0, Vector3::zeros()));
    let ax = sys.add_anchor(Vector3::x());
    let ay = sys.add_anchor(Vector3::y());
    let (ex, cx) = sys.add_simple_muscle("strong", p, ax, strong).unwrap();
    let (ey, cy) = sys.add_simple_muscle("weak", p, ay, weak).unwrap();
    Fixture {
        sys,
        source: MotionSource::Point(p),
        exciters: vec![cx, cy],
        effectors: vec![ex, ey],
        connectors: Vec::new(),
    }
}

/// Like [`planar_two_muscle`] but with a quadratic force-excitation relation,
/// so the response depends on the excitation. The particle starts off-center
/// and moving.
pub fn nonlinear_two_muscle(max_force: f64, beta: f64) -> Fixture {
    let mut sys = MassSpringSystem::new();
    let p = sys.add_particle(Particle::new(1.0, Vector3::new(0.1, 0.1, 0.0)));
    let ax = sys.add_anchor(Vector3::x());
    let ay = sys.add_anchor(Vector3::y());
    let cx = sys.add_exciter("x");
    let cy = sys.add_exciter("y");
    let shape = |exciter| {
        Actuation::new(max_force)
            .with_nonlinearity(beta)
            .with_activation_stiffness(max_force / 2.0)
            .with_source(exciter, 1.0)
    };
    let ex = sys.add_muscle(p, ax, shape(cx)).unwrap();
    let ey = sys.add_muscle(p, ay, shape(cy)).unwrap();
    sys.set_point_velocity(p, Vector3::new(0.05, -0.02, 0.0)).unwrap();
    Fixture {
        sys,
        source: MotionSource::Point(p),
        exciters: vec![cx, cy],
        effectors: vec![ex, ey],
        connectors: Vec::new(),
    }
}

/// Unit-mass particle pinned at the origin, pulled toward `+x` by one
/// muscle. The pin reaction balances the muscle.
pub fn pinned_muscle_particle(max_force: f64) -> Fixture {
    let mut fx = single_muscle_particle(max_force);
    let MotionSource::Point(p) = fx.source else {
        unreachable!("single_muscle_particle tracks a point")
    };
    let pin = fx.sys.add_pin(p).unwrap();
    fx.connectors.push(pin);
    fx
}

/// Rigid frame at the origin with two markers, each pulled toward an anchor
/// above it. Tracks the frame.
pub fn frame_with_markers(max_force: f64) -> Fixture {
    let mut sys = MassSpringSystem::new();
    let body = sys.add_frame(Frame::new(
        1.0,
        0.1,
        frame_pose(Vector3::zeros(), Vector3::zeros()),
    ));
    let left = sys.add_marker(body, Vector3::new(-0.5, 0.0, 0.0)).unwrap();
    let right = sys.add_marker(body, Vector3::new(0.5, 0.0, 0.0)).unwrap();
    let al = sys.add_anchor(Vector3::new(-0.5, 1.0, 0.0));
    let ar = sys.add_anchor(Vector3::new(0.5, 1.0, 0.0));
    let (el, cl) = sys.add_simple_muscle("left", left, al, max_force).unwrap();
    let (er, cr) = sys.add_simple_muscle("right", right, ar, max_force).unwrap();
    Fixture {
        sys,
        source: MotionSource::Frame(body),
        exciters: vec![cl, cr],
        effectors: vec![el, er],
        connectors: Vec::new(),
    }
}
