//! Dense mass-spring-muscle system.

use invtrack_core::{
    ConnectorId, DynamicsError, DynamicsSolver, EffectorId, ExciterId, ForceLinearization,
    Integrator, KktCoefficients, KktSolution, MechModel, MotionSource, SourcePose,
};
use nalgebra::{DMatrix, DVector, Isometry3, Matrix3, Unit, UnitQuaternion, Vector3};
use tracing::trace;

use crate::components::{
    Actuation, AxialEffector, Body, Connector, Exciter, Frame, Particle, Point,
};
use crate::kkt::KktFactorization;

/// Effectors shorter than this have no well-defined direction.
const MIN_LENGTH: f64 = 1e-12;

/// A system of particles, rigid frames, axial springs/muscles and bilateral
/// constraints, assembled densely.
#[derive(Clone, Debug)]
pub struct MassSpringSystem {
    bodies: Vec<Body>,
    offsets: Vec<usize>,
    points: Vec<Point>,
    effectors: Vec<AxialEffector>,
    connectors: Vec<Connector>,
    exciters: Vec<Exciter>,
    gravity: Vector3<f64>,
    integrator: Integrator,

    vel_size: usize,
    mass: DMatrix<f64>,
    constraints: DMatrix<f64>,
    forces: DVector<f64>,
    kkt: Option<KktFactorization>,
    last_lambda: DVector<f64>,
}

impl Default for MassSpringSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl MassSpringSystem {
    /// Empty system without gravity.
    pub fn new() -> Self {
        Self {
            bodies: Vec::new(),
            offsets: Vec::new(),
            points: Vec::new(),
            effectors: Vec::new(),
            connectors: Vec::new(),
            exciters: Vec::new(),
            gravity: Vector3::zeros(),
            integrator: Integrator::BackwardEuler,
            vel_size: 0,
            mass: DMatrix::zeros(0, 0),
            constraints: DMatrix::zeros(0, 0),
            forces: DVector::zeros(0),
            kkt: None,
            last_lambda: DVector::zeros(0),
        }
    }

    #[must_use]
    pub fn with_gravity(mut self, gravity: Vector3<f64>) -> Self {
        self.gravity = gravity;
        self
    }

    #[must_use]
    pub fn with_integrator(mut self, integrator: Integrator) -> Self {
        self.integrator = integrator;
        self
    }

    // -----------------------------------------------------------------------
    // Building
    // -----------------------------------------------------------------------

    /// Add a particle and return its point index.
    pub fn add_particle(&mut self, particle: Particle) -> usize {
        self.bodies.push(Body::Particle(particle));
        let body = self.bodies.len() - 1;
        self.points.push(Point::Particle { body });
        self.refresh();
        self.points.len() - 1
    }

    /// Add a fixed point and return its point index.
    pub fn add_anchor(&mut self, position: Vector3<f64>) -> usize {
        self.points.push(Point::Anchor { position });
        self.points.len() - 1
    }

    /// Add a rigid frame and return its body index.
    pub fn add_frame(&mut self, frame: Frame) -> usize {
        self.bodies.push(Body::Frame(frame));
        self.refresh();
        self.bodies.len() - 1
    }

    /// Attach a point to a frame at a body-local offset.
    pub fn add_marker(&mut self, body: usize, offset: Vector3<f64>) -> Result<usize, DynamicsError> {
        self.frame(body)?;
        self.points.push(Point::Marker { body, offset });
        Ok(self.points.len() - 1)
    }

    pub fn add_exciter(&mut self, name: impl Into<String>) -> ExciterId {
        self.exciters.push(Exciter {
            name: name.into(),
            excitation: 0.0,
        });
        ExciterId(self.exciters.len() - 1)
    }

    /// Passive spring between two points, at rest in the current configuration.
    pub fn add_spring(
        &mut self,
        a: usize,
        b: usize,
        stiffness: f64,
        damping: f64,
    ) -> Result<EffectorId, DynamicsError> {
        self.add_effector(a, b, stiffness, damping, None)
    }

    /// Muscle between two points, at rest in the current configuration.
    pub fn add_muscle(
        &mut self,
        a: usize,
        b: usize,
        actuation: Actuation,
    ) -> Result<EffectorId, DynamicsError> {
        for &(exciter, _) in &actuation.sources {
            self.exciter_ref(exciter)?;
        }
        self.add_effector(a, b, 0.0, 0.0, Some(actuation))
    }

    /// Muscle with its own exciter channel.
    pub fn add_simple_muscle(
        &mut self,
        name: &str,
        a: usize,
        b: usize,
        max_force: f64,
    ) -> Result<(EffectorId, ExciterId), DynamicsError> {
        let exciter = self.add_exciter(name);
        let effector = self.add_muscle(a, b, Actuation::new(max_force).with_source(exciter, 1.0))?;
        Ok((effector, exciter))
    }

    fn add_effector(
        &mut self,
        a: usize,
        b: usize,
        stiffness: f64,
        damping: f64,
        actuation: Option<Actuation>,
    ) -> Result<EffectorId, DynamicsError> {
        let rest_length = (self.point_position(b)? - self.point_position(a)?).norm();
        self.effectors.push(AxialEffector {
            a,
            b,
            rest_length,
            stiffness,
            damping,
            actuation,
        });
        self.update_forces(0.0);
        Ok(EffectorId(self.effectors.len() - 1))
    }

    pub fn add_connector(&mut self, connector: Connector) -> Result<ConnectorId, DynamicsError> {
        match &connector {
            Connector::Pin { point } | Connector::Axis { point, .. } => {
                self.point_ref(*point)?;
            }
            Connector::Rod { a, b } => {
                self.point_ref(*a)?;
                self.point_ref(*b)?;
            }
        }
        self.connectors.push(connector);
        self.refresh();
        Ok(ConnectorId(self.connectors.len() - 1))
    }

    pub fn add_pin(&mut self, point: usize) -> Result<ConnectorId, DynamicsError> {
        self.add_connector(Connector::Pin { point })
    }

    pub fn add_axis_constraint(
        &mut self,
        point: usize,
        axis: Vector3<f64>,
    ) -> Result<ConnectorId, DynamicsError> {
        self.add_connector(Connector::Axis {
            point,
            axis: Unit::new_normalize(axis),
        })
    }

    pub fn add_rod(&mut self, a: usize, b: usize) -> Result<ConnectorId, DynamicsError> {
        self.add_connector(Connector::Rod { a, b })
    }

    fn refresh(&mut self) {
        self.update_state_sizes();
        self.update_mass_matrix(0.0);
        self.update_constraints(0.0);
        self.update_forces(0.0);
    }

    // -----------------------------------------------------------------------
    // Access
    // -----------------------------------------------------------------------

    pub fn num_points(&self) -> usize {
        self.points.len()
    }

    pub fn effector(&self, id: EffectorId) -> Option<&AxialEffector> {
        self.effectors.get(id.0)
    }

    pub fn effector_mut(&mut self, id: EffectorId) -> Option<&mut AxialEffector> {
        self.effectors.get_mut(id.0)
    }

    pub fn exciter_name(&self, id: ExciterId) -> Option<&str> {
        self.exciters.get(id.0).map(|e| e.name.as_str())
    }

    pub fn exciter_ids(&self) -> impl Iterator<Item = ExciterId> + '_ {
        (0..self.exciters.len()).map(ExciterId)
    }

    pub fn gravity(&self) -> Vector3<f64> {
        self.gravity
    }

    /// World position of a point.
    pub fn point_position(&self, point: usize) -> Result<Vector3<f64>, DynamicsError> {
        match self.point_ref(point)? {
            Point::Particle { body } => Ok(self.particle(*body)?.position),
            Point::Anchor { position } => Ok(*position),
            Point::Marker { body, offset } => {
                Ok(self.frame(*body)?.pose.transform_point(&(*offset).into()).coords)
            }
        }
    }

    /// Set the velocity of the particle behind a point.
    pub fn set_point_velocity(
        &mut self,
        point: usize,
        velocity: Vector3<f64>,
    ) -> Result<(), DynamicsError> {
        let body = match self.point_ref(point)? {
            Point::Particle { body } => *body,
            _ => return Err(DynamicsError::UnknownComponent(point)),
        };
        match self.bodies.get_mut(body) {
            Some(Body::Particle(p)) => {
                p.velocity = velocity;
                Ok(())
            }
            _ => Err(DynamicsError::UnknownComponent(body)),
        }
    }

    /// Net excitation of an effector after combining its sources.
    pub fn net_excitation(&self, actuation: &Actuation) -> f64 {
        actuation.rule.combine(
            actuation
                .sources
                .iter()
                .map(|&(id, gain)| gain * self.exciters.get(id.0).map_or(0.0, |e| e.excitation)),
        )
    }

    /// Current tension of an effector.
    pub fn tension(&self, id: EffectorId) -> Result<f64, DynamicsError> {
        let eff = self
            .effectors
            .get(id.0)
            .ok_or(DynamicsError::UnknownComponent(id.0))?;
        Ok(self.effector_state(eff)?.tension)
    }

    /// Kinetic energy of the active state.
    pub fn kinetic_energy(&self) -> f64 {
        let v = self.active_velocity();
        0.5 * v.dot(&(&self.mass * &v))
    }

    fn point_ref(&self, point: usize) -> Result<&Point, DynamicsError> {
        self.points
            .get(point)
            .ok_or(DynamicsError::UnknownComponent(point))
    }

    fn exciter_ref(&self, id: ExciterId) -> Result<&Exciter, DynamicsError> {
        self.exciters
            .get(id.0)
            .ok_or(DynamicsError::UnknownComponent(id.0))
    }

    fn particle(&self, body: usize) -> Result<&Particle, DynamicsError> {
        match self.bodies.get(body) {
            Some(Body::Particle(p)) => Ok(p),
            _ => Err(DynamicsError::UnknownComponent(body)),
        }
    }

    fn frame(&self, body: usize) -> Result<&Frame, DynamicsError> {
        match self.bodies.get(body) {
            Some(Body::Frame(f)) => Ok(f),
            _ => Err(DynamicsError::UnknownComponent(body)),
        }
    }

    // -----------------------------------------------------------------------
    // Kinematics
    // -----------------------------------------------------------------------

    /// 3 x n Jacobian of a point's velocity.
    fn point_jacobian(&self, point: usize) -> Result<DMatrix<f64>, DynamicsError> {
        let mut j = DMatrix::zeros(3, self.vel_size);
        match self.point_ref(point)? {
            Point::Particle { body } => {
                j.view_mut((0, self.offsets[*body]), (3, 3))
                    .copy_from(&Matrix3::identity());
            }
            Point::Anchor { .. } => {}
            Point::Marker { body, offset } => {
                let frame = self.frame(*body)?;
                let r = frame.pose.rotation * offset;
                let off = self.offsets[*body];
                j.view_mut((0, off), (3, 3)).copy_from(&Matrix3::identity());
                j.view_mut((0, off + 3), (3, 3)).copy_from(&(-r.cross_matrix()));
            }
        }
        Ok(j)
    }

    fn effector_state(&self, eff: &AxialEffector) -> Result<EffectorState, DynamicsError> {
        let xa = self.point_position(eff.a)?;
        let xb = self.point_position(eff.b)?;
        let ja = self.point_jacobian(eff.a)?;
        let jb = self.point_jacobian(eff.b)?;
        let d = jb - ja;

        let delta = xb - xa;
        let length = delta.norm();
        let dir = if length > MIN_LENGTH {
            delta / length
        } else {
            Vector3::zeros()
        };
        let vel = &d * self.active_velocity();
        let ldot = dir.dot(&Vector3::new(vel[0], vel[1], vel[2]));

        let stretch = length - eff.rest_length;
        let mut tension = eff.stiffness * stretch + eff.damping * ldot;
        let mut axial_stiffness = eff.stiffness;
        if let Some(act) = &eff.actuation {
            let a = self.net_excitation(act);
            tension += act.max_force * act.force_scale(a) + act.activation_stiffness * a * stretch;
            axial_stiffness += act.activation_stiffness * a;
        }
        Ok(EffectorState {
            d,
            dir,
            length,
            tension,
            axial_stiffness,
            damping: eff.damping,
        })
    }

    fn constraint_rows(&self, connector: &Connector) -> Result<DMatrix<f64>, DynamicsError> {
        match connector {
            Connector::Pin { point } => self.point_jacobian(*point),
            Connector::Axis { point, axis } => Ok(row3(axis) * self.point_jacobian(*point)?),
            Connector::Rod { a, b } => {
                let delta = self.point_position(*b)? - self.point_position(*a)?;
                let len = delta.norm();
                let dir = if len > MIN_LENGTH {
                    delta / len
                } else {
                    Vector3::zeros()
                };
                let d = self.point_jacobian(*b)? - self.point_jacobian(*a)?;
                Ok(row3(&dir) * d)
            }
        }
    }

    fn connector_offsets(&self) -> Vec<usize> {
        let mut offsets = Vec::with_capacity(self.connectors.len() + 1);
        let mut row = 0;
        for c in &self.connectors {
            offsets.push(row);
            row += c.size();
        }
        offsets.push(row);
        offsets
    }

    // -----------------------------------------------------------------------
    // Force Jacobians
    // -----------------------------------------------------------------------

    /// `df/dx` and `df/dv` of the active forces.
    fn force_jacobians(&self) -> Result<(DMatrix<f64>, DMatrix<f64>), DynamicsError> {
        let n = self.vel_size;
        let mut dv = DMatrix::zeros(n, n);
        for (body, &off) in self.bodies.iter().zip(&self.offsets) {
            let (m, d, size) = match body {
                Body::Particle(p) => (p.mass, p.damping, 3),
                Body::Frame(f) => (f.mass, f.damping, 6),
            };
            for i in 0..size {
                dv[(off + i, off + i)] -= d * m;
            }
        }
        let dx = -self.stiffness_matrix();
        for eff in &self.effectors {
            let st = self.effector_state(eff)?;
            let uu = mat3(&(st.dir * st.dir.transpose()));
            dv -= st.d.transpose() * (uu * st.damping) * &st.d;
        }
        Ok((dx, dv))
    }

    // -----------------------------------------------------------------------
    // Forward dynamics
    // -----------------------------------------------------------------------

    /// Advance the state from `t0` to `t1` with the linearized implicit
    /// integrator.
    pub fn advance(&mut self, t0: f64, t1: f64) -> Result<(), DynamicsError> {
        let h = t1 - t0;
        let vel0 = self.active_velocity();
        self.update_constraints(t0);
        self.update_forces(t0);
        let mut f = self.forces.clone();
        self.add_mass_forces(&mut f, t0);

        let rhs = self.mul_active_inertias(&vel0) + f * h;
        let coeffs = KktCoefficients::for_integrator(self.integrator, h);
        let sol = self.kkt_factor_and_solve(&rhs, &vel0, h, coeffs)?;

        let step_vel = match self.integrator {
            Integrator::BackwardEuler => sol.velocity.clone(),
            Integrator::Trapezoidal => (&sol.velocity + &vel0) * 0.5,
        };
        self.set_active_velocity(&sol.velocity);
        self.integrate_positions(&step_vel, h);
        self.update_constraints(t1);
        self.update_forces(t1);
        trace!(t1, energy = self.kinetic_energy(), "advanced mass-spring system");
        Ok(())
    }

    fn set_active_velocity(&mut self, v: &DVector<f64>) {
        for (body, &off) in self.bodies.iter_mut().zip(&self.offsets) {
            match body {
                Body::Particle(p) => {
                    p.velocity = Vector3::new(v[off], v[off + 1], v[off + 2]);
                }
                Body::Frame(f) => {
                    f.velocity = Vector3::new(v[off], v[off + 1], v[off + 2]);
                    f.angular_velocity = Vector3::new(v[off + 3], v[off + 4], v[off + 5]);
                }
            }
        }
    }

    fn integrate_positions(&mut self, v: &DVector<f64>, h: f64) {
        for (body, &off) in self.bodies.iter_mut().zip(&self.offsets) {
            match body {
                Body::Particle(p) => {
                    p.position += Vector3::new(v[off], v[off + 1], v[off + 2]) * h;
                }
                Body::Frame(f) => {
                    f.pose.translation.vector += Vector3::new(v[off], v[off + 1], v[off + 2]) * h;
                    let w = Vector3::new(v[off + 3], v[off + 4], v[off + 5]);
                    if w.norm() > 1e-12 {
                        f.pose.rotation = UnitQuaternion::from_scaled_axis(w * h) * f.pose.rotation;
                    }
                }
            }
        }
    }
}

/// Geometry and tension of one axial effector.
struct EffectorState {
    /// Relative point Jacobian `Jb - Ja` (3 x n).
    d: DMatrix<f64>,
    dir: Vector3<f64>,
    length: f64,
    tension: f64,
    axial_stiffness: f64,
    damping: f64,
}

// ---------------------------------------------------------------------------
// MechModel
// ---------------------------------------------------------------------------

impl MechModel for MassSpringSystem {
    fn active_vel_state_size(&self) -> usize {
        self.vel_size
    }

    fn active_velocity(&self) -> DVector<f64> {
        let mut v = DVector::zeros(self.vel_size);
        for (body, &off) in self.bodies.iter().zip(&self.offsets) {
            match body {
                Body::Particle(p) => v.fixed_rows_mut::<3>(off).copy_from(&p.velocity),
                Body::Frame(f) => {
                    v.fixed_rows_mut::<3>(off).copy_from(&f.velocity);
                    v.fixed_rows_mut::<3>(off + 3).copy_from(&f.angular_velocity);
                }
            }
        }
        v
    }

    fn integrator(&self) -> Integrator {
        self.integrator
    }

    fn num_exciters(&self) -> usize {
        self.exciters.len()
    }

    fn excitation(&self, id: ExciterId) -> Result<f64, DynamicsError> {
        Ok(self.exciter_ref(id)?.excitation)
    }

    fn set_excitation(&mut self, id: ExciterId, value: f64) -> Result<(), DynamicsError> {
        let exciter = self
            .exciters
            .get_mut(id.0)
            .ok_or(DynamicsError::UnknownComponent(id.0))?;
        exciter.excitation = value;
        Ok(())
    }

    fn update_constraints(&mut self, _t: f64) {
        let rows: usize = self.connectors.iter().map(Connector::size).sum();
        let mut g = DMatrix::zeros(rows, self.vel_size);
        let offsets = self.connector_offsets();
        for (c, &row) in self.connectors.iter().zip(&offsets) {
            // Connectors are validated on insertion.
            if let Ok(block) = self.constraint_rows(c) {
                g.view_mut((row, 0), (c.size(), self.vel_size)).copy_from(&block);
            }
        }
        self.constraints = g;
    }

    fn update_forces(&mut self, _t: f64) {
        let mut f = DVector::zeros(self.vel_size);
        for (body, &off) in self.bodies.iter().zip(&self.offsets) {
            match body {
                Body::Particle(p) => {
                    let fp = self.gravity * p.mass - p.velocity * (p.damping * p.mass);
                    let mut seg = f.fixed_rows_mut::<3>(off);
                    seg += fp;
                }
                Body::Frame(fr) => {
                    let fl = self.gravity * fr.mass - fr.velocity * (fr.damping * fr.mass);
                    let fw = -fr.angular_velocity * (fr.damping * fr.mass);
                    let mut lin = f.fixed_rows_mut::<3>(off);
                    lin += fl;
                    let mut ang = f.fixed_rows_mut::<3>(off + 3);
                    ang += fw;
                }
            }
        }
        for eff in &self.effectors {
            if let Ok(st) = self.effector_state(eff) {
                // Positive tension pulls b toward a.
                let fb = -st.dir * st.tension;
                f += st.d.transpose() * DVector::from_column_slice(fb.as_slice());
            }
        }
        self.forces = f;
    }

    fn active_forces(&self) -> DVector<f64> {
        self.forces.clone()
    }

    fn set_active_forces(&mut self, forces: &DVector<f64>) {
        self.forces.clone_from(forces);
    }

    fn num_bilateral_constraints(&self) -> usize {
        self.connectors.iter().map(Connector::size).sum()
    }

    fn source_pose(&self, source: MotionSource) -> Result<SourcePose, DynamicsError> {
        match source {
            MotionSource::Point(p) => Ok(SourcePose::Point(self.point_position(p)?)),
            MotionSource::Frame(b) => Ok(SourcePose::Frame(self.frame(b)?.pose)),
        }
    }

    fn source_velocity(&self, source: MotionSource) -> Result<DVector<f64>, DynamicsError> {
        Ok(self.velocity_jacobian(&[source])? * self.active_velocity())
    }

    fn velocity_jacobian(&self, sources: &[MotionSource]) -> Result<DMatrix<f64>, DynamicsError> {
        let rows: usize = sources.iter().map(|s| s.vel_size()).sum();
        let mut j = DMatrix::zeros(rows, self.vel_size);
        let mut row = 0;
        for &source in sources {
            match source {
                MotionSource::Point(p) => {
                    j.view_mut((row, 0), (3, self.vel_size))
                        .copy_from(&self.point_jacobian(p)?);
                }
                MotionSource::Frame(b) => {
                    self.frame(b)?;
                    j.view_mut((row, self.offsets[b]), (6, 6))
                        .copy_from(&DMatrix::identity(6, 6));
                }
            }
            row += source.vel_size();
        }
        Ok(j)
    }

    fn connector_size(&self, connector: ConnectorId) -> Result<usize, DynamicsError> {
        self.connectors
            .get(connector.0)
            .map(Connector::size)
            .ok_or(DynamicsError::UnknownComponent(connector.0))
    }

    fn constraint_force_jacobian(
        &self,
        connectors: &[ConnectorId],
    ) -> Result<DMatrix<f64>, DynamicsError> {
        let offsets = self.connector_offsets();
        let total = self.num_bilateral_constraints();
        let mut sizes = Vec::with_capacity(connectors.len());
        for &c in connectors {
            sizes.push(self.connector_size(c)?);
        }
        let mut jc = DMatrix::zeros(sizes.iter().sum(), total);
        let mut row = 0;
        for (&c, &size) in connectors.iter().zip(&sizes) {
            for k in 0..size {
                jc[(row + k, offsets[c.0] + k)] = 1.0;
            }
            row += size;
        }
        Ok(jc)
    }

    fn force_linearization(&self, effector: EffectorId) -> Result<ForceLinearization, DynamicsError> {
        let eff = self
            .effectors
            .get(effector.0)
            .ok_or(DynamicsError::UnknownComponent(effector.0))?;
        let st = self.effector_state(eff)?;
        let dl = row3(&st.dir) * &st.d;
        Ok(ForceLinearization {
            force: DVector::from_element(1, st.tension),
            dfdx: &dl * st.axial_stiffness,
            dfdv: dl * st.damping,
        })
    }

    fn stiffness_matrix(&self) -> DMatrix<f64> {
        let n = self.vel_size;
        let mut k = DMatrix::zeros(n, n);
        for eff in &self.effectors {
            let Ok(st) = self.effector_state(eff) else {
                continue;
            };
            let uu = st.dir * st.dir.transpose();
            let mut kp = uu * st.axial_stiffness;
            if st.length > MIN_LENGTH {
                kp += (Matrix3::identity() - uu) * (st.tension / st.length);
            }
            k += st.d.transpose() * mat3(&kp) * &st.d;
        }
        k
    }
}

// ---------------------------------------------------------------------------
// DynamicsSolver
// ---------------------------------------------------------------------------

impl DynamicsSolver for MassSpringSystem {
    fn update_state_sizes(&mut self) {
        self.offsets.clear();
        let mut off = 0;
        for body in &self.bodies {
            self.offsets.push(off);
            off += body.vel_size();
        }
        self.vel_size = off;
    }

    fn update_mass_matrix(&mut self, _t: f64) {
        let mut m = DMatrix::zeros(self.vel_size, self.vel_size);
        for (body, &off) in self.bodies.iter().zip(&self.offsets) {
            match body {
                Body::Particle(p) => {
                    for i in 0..3 {
                        m[(off + i, off + i)] = p.mass;
                    }
                }
                Body::Frame(f) => {
                    for i in 0..3 {
                        m[(off + i, off + i)] = f.mass;
                        m[(off + 3 + i, off + 3 + i)] = f.inertia;
                    }
                }
            }
        }
        self.mass = m;
    }

    fn mul_active_inertias(&self, v: &DVector<f64>) -> DVector<f64> {
        &self.mass * v
    }

    fn add_mass_forces(&self, _f: &mut DVector<f64>, _t: f64) {
        // Isotropic inertias produce no gyroscopic forces.
    }

    fn kkt_factor_and_solve(
        &mut self,
        rhs: &DVector<f64>,
        vel0: &DVector<f64>,
        h: f64,
        coeffs: KktCoefficients,
    ) -> Result<KktSolution, DynamicsError> {
        if rhs.len() != self.vel_size || vel0.len() != self.vel_size {
            return Err(DynamicsError::DimensionMismatch {
                expected: self.vel_size,
                got: rhs.len().min(vel0.len()),
            });
        }
        let (dx, dv) = self.force_jacobians()?;
        let s = &self.mass + &dv * coeffs.a0 + &dx * coeffs.a1;
        let mut b = rhs.clone();
        b += &dv * vel0 * coeffs.a2;
        if coeffs.a3 != 0.0 {
            b += &dx * vel0 * coeffs.a3;
        }

        self.kkt = None;
        let kkt = KktFactorization::factor(&s, &self.constraints, h)?;
        let sol = kkt.solve(&b, &DVector::zeros(self.constraints.nrows()))?;
        self.kkt = Some(kkt);
        self.last_lambda.clone_from(&sol.lambda);
        Ok(sol)
    }

    fn kkt_solve(&self, rhs: &DVector<f64>) -> Result<KktSolution, DynamicsError> {
        let kkt = self.kkt.as_ref().ok_or(DynamicsError::NotFactored)?;
        kkt.solve(rhs, &DVector::zeros(self.constraints.nrows()))
    }

    fn lambda(&self) -> DVector<f64> {
        self.last_lambda.clone()
    }
}

fn row3(v: &Vector3<f64>) -> DMatrix<f64> {
    DMatrix::from_row_slice(1, 3, v.as_slice())
}

fn mat3(m: &Matrix3<f64>) -> DMatrix<f64> {
    DMatrix::from_column_slice(3, 3, m.as_slice())
}

/// Pose helper for building frames.
pub fn frame_pose(translation: Vector3<f64>, rotation: Vector3<f64>) -> Isometry3<f64> {
    Isometry3::new(translation, rotation)
}
