//! Bounding volumes and half-spaces
//!
//! World bounds of spans, lights and shadow casters are axis-aligned boxes.
//! Culling works with planes whose positive side is "inside".

use crate::foundation::math::{Mat4, Point3, Vec3};

/// Axis-Aligned Bounding Box for spatial queries
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AABB {
    /// Minimum corner of the bounding box
    pub min: Vec3,
    /// Maximum corner of the bounding box
    pub max: Vec3,
}

impl AABB {
    /// Create a new AABB from min and max points
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Create an AABB centered at a point with given extents
    pub fn from_center_extents(center: Vec3, extents: Vec3) -> Self {
        Self {
            min: center - extents,
            max: center + extents,
        }
    }

    /// Smallest box containing every point, `None` for an empty set
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a Vec3>) -> Option<Self> {
        let mut points = points.into_iter();
        let first = *points.next()?;
        Some(points.fold(Self::new(first, first), |bounds, point| bounds.including(point)))
    }

    /// Get the center of the AABB
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Get the extents (half-size) of the AABB
    pub fn extents(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    /// Radius of the bounding sphere around the box
    pub fn radius(&self) -> f32 {
        self.extents().norm()
    }

    /// Check if this AABB contains a point
    pub fn contains_point(&self, point: Vec3) -> bool {
        point.x >= self.min.x && point.x <= self.max.x &&
        point.y >= self.min.y && point.y <= self.max.y &&
        point.z >= self.min.z && point.z <= self.max.z
    }

    /// Check if this AABB intersects another AABB
    pub fn intersects(&self, other: &AABB) -> bool {
        self.min.x <= other.max.x && self.max.x >= other.min.x &&
        self.min.y <= other.max.y && self.max.y >= other.min.y &&
        self.min.z <= other.max.z && self.max.z >= other.min.z
    }

    /// Box grown to include `point`
    pub fn including(&self, point: &Vec3) -> Self {
        Self::new(self.min.inf(point), self.max.sup(point))
    }

    /// Smallest box containing both boxes
    pub fn union(&self, other: &AABB) -> Self {
        Self::new(self.min.inf(&other.min), self.max.sup(&other.max))
    }

    /// The eight corners
    pub fn corners(&self) -> [Vec3; 8] {
        let (a, b) = (self.min, self.max);
        [
            Vec3::new(a.x, a.y, a.z),
            Vec3::new(b.x, a.y, a.z),
            Vec3::new(a.x, b.y, a.z),
            Vec3::new(b.x, b.y, a.z),
            Vec3::new(a.x, a.y, b.z),
            Vec3::new(b.x, a.y, b.z),
            Vec3::new(a.x, b.y, b.z),
            Vec3::new(b.x, b.y, b.z),
        ]
    }

    /// Bounds of this box after an affine transform
    pub fn transformed(&self, matrix: &Mat4) -> Self {
        let corners = self
            .corners()
            .map(|corner| matrix.transform_point(&Point3::from(corner)).coords);
        Self::from_points(corners.iter()).unwrap_or(*self)
    }
}

/// Which side of a plane a volume lies on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneSide {
    /// Entirely on the positive side
    Front,
    /// Entirely on the negative side
    Back,
    /// Crosses the plane
    Straddle,
}

/// Plane defined by normal and distance from origin
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane {
    /// Normal vector (should be normalized)
    pub normal: Vec3,
    /// Distance from origin along the normal
    pub distance: f32,
}

impl Plane {
    /// Create a new plane from normal and distance
    pub fn new(normal: Vec3, distance: f32) -> Self {
        Self { normal: normal.normalize(), distance }
    }

    /// Plane through `point` facing `normal`
    pub fn from_point_normal(point: Vec3, normal: Vec3) -> Self {
        let normal = normal.normalize();
        Self { normal, distance: -normal.dot(&point) }
    }

    /// Plane from raw `ax + by + cz + d` coefficients, normalized
    pub fn from_coefficients(a: f32, b: f32, c: f32, d: f32) -> Self {
        let normal = Vec3::new(a, b, c);
        let length = normal.norm();
        if length <= f32::EPSILON {
            return Self { normal: Vec3::zeros(), distance: d };
        }
        Self { normal: normal / length, distance: d / length }
    }

    /// Calculate signed distance from plane to point
    pub fn distance_to_point(&self, point: Vec3) -> f32 {
        self.normal.dot(&point) + self.distance
    }

    /// Same plane facing the other way
    pub fn flipped(&self) -> Self {
        Self { normal: -self.normal, distance: -self.distance }
    }

    /// Classify a box against this plane
    pub fn classify(&self, aabb: &AABB) -> PlaneSide {
        let extents = aabb.extents();
        let reach = self.normal.x.abs() * extents.x
            + self.normal.y.abs() * extents.y
            + self.normal.z.abs() * extents.z;
        let distance = self.distance_to_point(aabb.center());
        if distance > reach {
            PlaneSide::Front
        } else if distance < -reach {
            PlaneSide::Back
        } else {
            PlaneSide::Straddle
        }
    }
}

/// Frustum for visibility culling
#[derive(Debug, Clone, PartialEq)]
pub struct Frustum {
    /// Six inward-facing planes (left, right, bottom, top, near, far)
    pub planes: [Plane; 6],
}

impl Frustum {
    /// Create a frustum from six planes
    pub fn new(planes: [Plane; 6]) -> Self {
        Self { planes }
    }

    /// Extract frustum planes from a view-projection matrix
    ///
    /// This uses the Gribb-Hartmann method for projections mapping depth to
    /// `[0, 1]`.
    pub fn from_matrix(vp_matrix: &Mat4) -> Self {
        let row = |i: usize| vp_matrix.row(i).transpose();
        let (r0, r1, r2, r3) = (row(0), row(1), row(2), row(3));
        let plane = |v: crate::foundation::math::Vec4| Plane::from_coefficients(v.x, v.y, v.z, v.w);

        Self {
            planes: [
                plane(r3 + r0),
                plane(r3 - r0),
                plane(r3 + r1),
                plane(r3 - r1),
                plane(r2),
                plane(r3 - r2),
            ],
        }
    }

    /// Check if an AABB is inside or intersects the frustum
    pub fn intersects_aabb(&self, aabb: &AABB) -> bool {
        self.planes.iter().all(|plane| plane.classify(aabb) != PlaneSide::Back)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Mat4Ext;

    #[test]
    fn test_aabb_contains_point() {
        let aabb = AABB::new(Vec3::new(-1.0, -1.0, -1.0), Vec3::new(1.0, 1.0, 1.0));

        assert!(aabb.contains_point(Vec3::zeros()));
        assert!(aabb.contains_point(Vec3::new(0.5, 0.5, 0.5)));
        assert!(!aabb.contains_point(Vec3::new(2.0, 0.0, 0.0)));
    }

    #[test]
    fn test_aabb_intersects() {
        let aabb1 = AABB::new(Vec3::new(0.0, 0.0, 0.0), Vec3::new(2.0, 2.0, 2.0));
        let aabb2 = AABB::new(Vec3::new(1.0, 1.0, 1.0), Vec3::new(3.0, 3.0, 3.0));
        let aabb3 = AABB::new(Vec3::new(5.0, 5.0, 5.0), Vec3::new(7.0, 7.0, 7.0));

        assert!(aabb1.intersects(&aabb2));
        assert!(!aabb1.intersects(&aabb3));
        assert_eq!(aabb1.union(&aabb3), AABB::new(Vec3::zeros(), Vec3::new(7.0, 7.0, 7.0)));
    }

    #[test]
    fn test_plane_classifies_boxes() {
        let plane = Plane::from_point_normal(Vec3::zeros(), Vec3::x());
        let unit = Vec3::new(0.5, 0.5, 0.5);

        assert_eq!(plane.classify(&AABB::from_center_extents(Vec3::new(2.0, 0.0, 0.0), unit)), PlaneSide::Front);
        assert_eq!(plane.classify(&AABB::from_center_extents(Vec3::new(-2.0, 0.0, 0.0), unit)), PlaneSide::Back);
        assert_eq!(plane.classify(&AABB::from_center_extents(Vec3::zeros(), unit)), PlaneSide::Straddle);
    }

    #[test]
    fn test_frustum_from_matrix_culls_behind_camera() {
        let view = Mat4::look_at(Vec3::zeros(), Vec3::new(0.0, 0.0, -1.0), Vec3::y());
        let proj = Mat4::perspective(std::f32::consts::FRAC_PI_2, 1.0, 0.1, 100.0);
        let frustum = Frustum::from_matrix(&(proj * view));
        let unit = Vec3::new(0.5, 0.5, 0.5);

        assert!(frustum.intersects_aabb(&AABB::from_center_extents(Vec3::new(0.0, 0.0, -10.0), unit)));
        assert!(!frustum.intersects_aabb(&AABB::from_center_extents(Vec3::new(0.0, 0.0, 10.0), unit)));
        assert!(!frustum.intersects_aabb(&AABB::from_center_extents(Vec3::new(0.0, 0.0, -200.0), unit)));
        assert!(!frustum.intersects_aabb(&AABB::from_center_extents(Vec3::new(50.0, 0.0, -10.0), unit)));
    }
}
