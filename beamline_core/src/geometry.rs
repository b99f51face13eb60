//! Telescope geometry: sensor planes, beam axis, and the local/global
//! coordinate transformations used by tracking and alignment.
//!
//! Each sensor plane is described by a global offset and an orthonormal
//! rotation whose columns are the local u, v, w axes expressed in global
//! coordinates. Local positions are 4-vectors (u, v, w, s) with w = 0 on
//! the plane and s the local time; global positions are (x, y, z, t).

use nalgebra::{Matrix2, Matrix3, Matrix4, Matrix6, Rotation3, Vector2, Vector3, Vector4, Vector6};

/// A single sensor plane placement in the global frame.
#[derive(Debug, Clone)]
pub struct Plane {
    offset: Vector3<f64>,
    rotation: Matrix3<f64>,
    correction_cov: Matrix6<f64>,
}

impl Plane {
    /// Creates a plane from an explicit offset and rotation matrix.
    ///
    /// The rotation must be orthonormal; its columns are the local axes.
    pub fn new(offset: Vector3<f64>, rotation: Matrix3<f64>) -> Self {
        Self {
            offset,
            rotation,
            correction_cov: Matrix6::zeros(),
        }
    }

    /// Creates a plane from an offset and intrinsic rotation angles.
    ///
    /// The rotation is built as Rz(gamma) * Ry(beta) * Rx(alpha).
    pub fn from_angles(offset: Vector3<f64>, alpha: f64, beta: f64, gamma: f64) -> Self {
        let rotation = *Rotation3::from_euler_angles(alpha, beta, gamma).matrix();
        Self::new(offset, rotation)
    }

    /// Global position of the plane origin.
    pub fn offset(&self) -> &Vector3<f64> {
        &self.offset
    }

    /// Local-to-global rotation matrix.
    pub fn rotation(&self) -> &Matrix3<f64> {
        &self.rotation
    }

    /// Accumulated covariance of the applied alignment corrections.
    pub fn correction_cov(&self) -> &Matrix6<f64> {
        &self.correction_cov
    }

    /// Plane normal (the local w axis) in global coordinates.
    pub fn normal(&self) -> Vector3<f64> {
        self.rotation.column(2).into_owned()
    }

    /// Transform a local (u, v, w, s) position to global (x, y, z, t).
    pub fn to_global(&self, local: &Vector4<f64>) -> Vector4<f64> {
        let xyz = self.offset + self.rotation * local.fixed_rows::<3>(0);
        Vector4::new(xyz[0], xyz[1], xyz[2], local[3])
    }

    /// Transform a global (x, y, z, t) position to local (u, v, w, s).
    pub fn to_local(&self, global: &Vector4<f64>) -> Vector4<f64> {
        let uvw = self.rotation.transpose() * (global.fixed_rows::<3>(0) - self.offset);
        Vector4::new(uvw[0], uvw[1], uvw[2], global[3])
    }

    /// Rotate a local direction or offset to the global frame, no translation.
    pub fn linear_to_global(&self, local: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * local
    }

    /// Rotate a global direction or offset to the local frame, no translation.
    pub fn linear_to_local(&self, global: &Vector3<f64>) -> Vector3<f64> {
        self.rotation.transpose() * global
    }

    /// Transform a local position covariance to the global frame.
    pub fn cov_to_global(&self, cov: &Matrix4<f64>) -> Matrix4<f64> {
        let mut jac = Matrix4::identity();
        jac.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.rotation);
        jac * cov * jac.transpose()
    }

    fn correct_global_offset(&mut self, dx: f64, dy: f64, dz: f64) {
        self.offset += Vector3::new(dx, dy, dz);
    }

    // Applies [du, dv, dw, dalpha, dbeta, dgamma]: translation along the
    // current local axes plus a rotation composed on the right. The angle
    // signs must stay consistent with the alignment Jacobian in
    // `aligner_localchi2`.
    fn correct_local(&mut self, delta: &Vector6<f64>, cov: &Matrix6<f64>) {
        self.offset += self.rotation * delta.fixed_rows::<3>(0);
        let dr = Rotation3::from_euler_angles(delta[3], delta[4], delta[5]);
        self.rotation = self.rotation * dr.matrix();
        self.correction_cov += cov;
    }
}

/// The full telescope geometry: one plane per sensor and the beam axis.
#[derive(Debug, Clone)]
pub struct Geometry {
    planes: Vec<Plane>,
    beam_direction: Vector3<f64>,
    beam_slope_cov: Matrix2<f64>,
}

impl Geometry {
    /// Creates a geometry from per-sensor planes and a beam direction.
    ///
    /// The beam direction is normalized; it must not be null and must have
    /// a positive z component so that planes can be ordered along it.
    pub fn new(
        planes: Vec<Plane>,
        beam_direction: Vector3<f64>,
        beam_slope_cov: Matrix2<f64>,
    ) -> Self {
        let norm = beam_direction.norm();
        assert!(norm > 0.0, "beam direction must not be null");
        Self {
            planes,
            beam_direction: beam_direction / norm,
            beam_slope_cov,
        }
    }

    /// Number of configured planes.
    pub fn num_planes(&self) -> usize {
        self.planes.len()
    }

    /// The plane for the given sensor id.
    pub fn plane(&self, sensor_id: usize) -> &Plane {
        &self.planes[sensor_id]
    }

    /// Unit beam direction in global coordinates.
    pub fn beam_direction(&self) -> &Vector3<f64> {
        &self.beam_direction
    }

    /// Beam slope (dx/dz, dy/dz) in global coordinates.
    pub fn beam_slope(&self) -> Vector2<f64> {
        Vector2::new(
            self.beam_direction[0] / self.beam_direction[2],
            self.beam_direction[1] / self.beam_direction[2],
        )
    }

    /// Beam slope covariance in global coordinates.
    pub fn beam_slope_cov(&self) -> &Matrix2<f64> {
        &self.beam_slope_cov
    }

    /// Beam slope (du/dw, dv/dw) in the local frame of the given sensor.
    pub fn beam_slope_in_local(&self, sensor_id: usize) -> Vector2<f64> {
        let d = self.planes[sensor_id].linear_to_local(&self.beam_direction);
        Vector2::new(d[0] / d[2], d[1] / d[2])
    }

    /// Beam slope covariance projected into the local frame.
    ///
    /// First-order propagation through the in-plane part of the rotation.
    pub fn beam_slope_cov_in_local(&self, sensor_id: usize) -> Matrix2<f64> {
        let rot = self.planes[sensor_id].rotation().transpose();
        let jac = rot.fixed_view::<2, 2>(0, 0).into_owned();
        jac * self.beam_slope_cov * jac.transpose()
    }

    /// Sensor ids sorted by their plane position along the beam axis.
    ///
    /// The sort is stable so that sensors at the same beam position keep
    /// their input order.
    pub fn sorted_along_beam(&self, sensor_ids: &[usize]) -> Vec<usize> {
        let mut sorted = sensor_ids.to_vec();
        sorted.sort_by(|&a, &b| {
            let za = self.planes[a].offset().dot(&self.beam_direction);
            let zb = self.planes[b].offset().dot(&self.beam_direction);
            za.partial_cmp(&zb).unwrap_or(std::cmp::Ordering::Equal)
        });
        sorted
    }

    /// Apply an additive translation to the plane in the global frame.
    pub fn correct_global_offset(&mut self, sensor_id: usize, dx: f64, dy: f64, dz: f64) {
        self.planes[sensor_id].correct_global_offset(dx, dy, dz);
    }

    /// Apply a six-parameter local correction to the plane.
    pub fn correct_local(&mut self, sensor_id: usize, delta: &Vector6<f64>, cov: &Matrix6<f64>) {
        self.planes[sensor_id].correct_local(delta, cov);
    }
}

/// Mahalanobis distance squared of a two-dimensional residual.
///
/// Returns `f64::MAX` if the covariance is singular so that the pair is
/// never accepted by a distance cut.
pub fn mahalanobis_squared(cov: &Matrix2<f64>, delta: &Vector2<f64>) -> f64 {
    match cov.try_inverse() {
        Some(inv) => (delta.transpose() * inv * delta)[(0, 0)],
        None => f64::MAX,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn simple_geometry() -> Geometry {
        let planes = vec![
            Plane::from_angles(Vector3::new(0.0, 0.0, 0.0), 0.0, 0.0, 0.0),
            Plane::from_angles(Vector3::new(0.0, 0.0, 50.0), 0.0, 0.0, 0.0),
            Plane::from_angles(Vector3::new(0.0, 0.0, 100.0), 0.0, 0.0, 0.0),
        ];
        Geometry::new(planes, Vector3::new(0.0, 0.0, 1.0), Matrix2::zeros())
    }

    #[test]
    fn local_global_round_trip() {
        let plane = Plane::from_angles(Vector3::new(1.0, -2.0, 30.0), 0.02, -0.01, 0.5);
        let local = Vector4::new(1.25, -0.75, 0.0, 4.0);
        let back = plane.to_local(&plane.to_global(&local));
        assert_abs_diff_eq!(local, back, epsilon = 1e-12);
    }

    #[test]
    fn sorted_along_beam_orders_planes() {
        let geo = simple_geometry();
        assert_eq!(geo.sorted_along_beam(&[2, 0, 1]), vec![0, 1, 2]);
    }

    #[test]
    fn rotations_stay_orthonormal_under_corrections() {
        let mut geo = simple_geometry();
        for i in 0..100 {
            let delta = Vector6::new(0.1, -0.2, 0.05, 0.01, -0.02, 0.03 * (i as f64 % 3.0));
            geo.correct_local(1, &delta, &Matrix6::zeros());
            geo.correct_global_offset(1, 0.1, 0.0, -0.1);
        }
        let rot = geo.plane(1).rotation();
        let residual = rot.transpose() * rot - Matrix3::identity();
        assert!(residual.norm() < 1e-10);
    }

    #[test]
    fn gamma_correction_moves_track_intersection_as_jacobian_predicts() {
        // a small rotation about w changes the local coordinates of a fixed
        // global point by (+gamma * v, -gamma * u)
        let mut geo = simple_geometry();
        let point = geo.plane(1).to_global(&Vector4::new(2.0, 3.0, 0.0, 0.0));
        let gamma = 1e-6;
        let delta = Vector6::new(0.0, 0.0, 0.0, 0.0, 0.0, gamma);
        geo.correct_local(1, &delta, &Matrix6::zeros());
        let local = geo.plane(1).to_local(&point);
        assert_abs_diff_eq!(local[0], 2.0 + gamma * 3.0, epsilon = 1e-10);
        assert_abs_diff_eq!(local[1], 3.0 - gamma * 2.0, epsilon = 1e-10);
    }

    #[test]
    fn beam_slope_in_tilted_plane() {
        let planes = vec![Plane::from_angles(Vector3::zeros(), 0.0, 0.1, 0.0)];
        let geo = Geometry::new(planes, Vector3::new(0.0, 0.0, 1.0), Matrix2::zeros());
        let slope = geo.beam_slope_in_local(0);
        // rotating the plane by beta about v tilts the beam by -beta in u
        assert_abs_diff_eq!(slope[0], -(0.1f64).tan(), epsilon = 1e-12);
        assert_abs_diff_eq!(slope[1], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn mahalanobis_squared_singular_cov_is_rejected() {
        let cov = Matrix2::zeros();
        let delta = Vector2::new(1.0, 1.0);
        assert_eq!(mahalanobis_squared(&cov, &delta), f64::MAX);
    }

    #[test]
    fn mahalanobis_squared_diagonal() {
        let cov = Matrix2::new(4.0, 0.0, 0.0, 9.0);
        let delta = Vector2::new(2.0, 3.0);
        assert_abs_diff_eq!(mahalanobis_squared(&cov, &delta), 2.0, epsilon = 1e-12);
    }
}
