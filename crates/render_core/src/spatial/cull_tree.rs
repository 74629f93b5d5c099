//! Frustum and occluder BSP
//!
//! The cull tree combines the view frustum half-spaces and the shadow
//! volumes of convex occluder polygons into one BSP. Every leaf is either
//! visible or hidden; a box is classified by pushing it down the tree and
//! collecting the leaves it reaches.
//!
//! The tree is rebuilt lazily. Changing the view or the occluder set only
//! raises a dirty flag; [`CullTree::refresh`] rebuilds on the next query.
//!
//! # Layout
//!
//! ```text
//! frustum plane 0 --back--> Hidden
//!   |front
//! frustum plane 1 --back--> Hidden
//!   ...
//! occluder 0 face --back--> occluder 1 ...
//!   |front
//! occluder 0 edge 0 --back--> occluder 1 ...
//!   ...
//! occluder 0 edge n --front--> Hidden
//!                   --back---> occluder 1 ... --> Visible
//! ```

use crate::foundation::math::{Mat4, Vec3};
use crate::scene::{Frustum, Plane, PlaneSide, AABB};

/// Result of classifying a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Visibility {
    /// Entirely outside the frustum or behind occluders
    Hidden,
    /// Partly visible
    Partial,
    /// Entirely visible
    Visible,
}

impl Visibility {
    fn merge(self, other: Self) -> Self {
        if self == other {
            self
        } else {
            Self::Partial
        }
    }
}

/// Convex polygon that hides what lies behind it
#[derive(Debug, Clone, PartialEq)]
pub struct Occluder {
    /// Polygon corners in winding order
    pub vertices: Vec<Vec3>,
    /// Occludes from both sides; otherwise only from the side its winding faces
    pub two_sided: bool,
}

impl Occluder {
    /// Create a one-sided occluder
    pub fn new(vertices: Vec<Vec3>) -> Self {
        Self { vertices, two_sided: false }
    }

    /// Occlude from both sides
    pub fn two_sided(mut self) -> Self {
        self.two_sided = true;
        self
    }

    /// Planes bounding the region hidden from `eye`, facing into it
    fn shadow_planes(&self, eye: Vec3) -> Option<Vec<Plane>> {
        if self.vertices.len() < 3 {
            return None;
        }

        let origin = self.vertices[0];
        let normal = (self.vertices[1] - origin).cross(&(self.vertices[2] - origin));
        if normal.norm_squared() <= f32::EPSILON {
            return None;
        }
        let face = Plane::from_point_normal(origin, normal);
        let eye_distance = face.distance_to_point(eye);
        if eye_distance.abs() <= f32::EPSILON || (eye_distance < 0.0 && !self.two_sided) {
            return None;
        }
        // The hidden region is on the side away from the eye
        let face = if eye_distance > 0.0 { face.flipped() } else { face };

        let centroid = self.vertices.iter().sum::<Vec3>() / self.vertices.len() as f32;
        let mut planes = vec![face];
        for (i, &a) in self.vertices.iter().enumerate() {
            let b = self.vertices[(i + 1) % self.vertices.len()];
            let edge_normal = (a - eye).cross(&(b - eye));
            if edge_normal.norm_squared() <= f32::EPSILON {
                continue;
            }
            let edge = Plane::from_point_normal(eye, edge_normal);
            planes.push(if edge.distance_to_point(centroid) >= 0.0 { edge } else { edge.flipped() });
        }
        Some(planes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Child {
    Node(usize),
    Leaf(Visibility),
}

#[derive(Debug, Clone)]
struct CullNode {
    plane: Plane,
    front: Child,
    back: Child,
}

/// Lazily rebuilt frustum + occluder BSP
#[derive(Debug, Clone, Default)]
pub struct CullTree {
    view_proj: Option<Mat4>,
    eye: Vec3,
    occluders: Vec<Occluder>,
    nodes: Vec<CullNode>,
    root: Option<Child>,
    dirty: bool,
    rebuilds: u32,
}

impl CullTree {
    /// Create an empty tree; everything is visible until a view is set
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the camera. Marks the tree dirty only when something changed.
    pub fn set_view(&mut self, view_proj: Mat4, eye: Vec3) {
        if self.view_proj != Some(view_proj) || self.eye != eye {
            self.view_proj = Some(view_proj);
            self.eye = eye;
            self.dirty = true;
        }
    }

    /// Add an occluder polygon
    pub fn add_occluder(&mut self, occluder: Occluder) {
        self.occluders.push(occluder);
        self.dirty = true;
    }

    /// Remove every occluder
    pub fn clear_occluders(&mut self) {
        if !self.occluders.is_empty() {
            self.occluders.clear();
            self.dirty = true;
        }
    }

    /// True when the next refresh rebuilds
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Number of rebuilds so far
    pub fn rebuild_count(&self) -> u32 {
        self.rebuilds
    }

    /// Rebuild if dirty, returning whether a rebuild happened
    pub fn refresh(&mut self) -> bool {
        if !self.dirty {
            return false;
        }
        self.rebuild();
        true
    }

    /// Classify a box. Uses the last built tree; call
    /// [`refresh`](Self::refresh) after changing the view or occluders.
    pub fn classify(&self, aabb: &AABB) -> Visibility {
        match self.root {
            Some(root) => self.classify_child(root, aabb),
            None => Visibility::Visible,
        }
    }

    fn classify_child(&self, child: Child, aabb: &AABB) -> Visibility {
        match child {
            Child::Leaf(visibility) => visibility,
            Child::Node(index) => {
                let node = &self.nodes[index];
                match node.plane.classify(aabb) {
                    PlaneSide::Front => self.classify_child(node.front, aabb),
                    PlaneSide::Back => self.classify_child(node.back, aabb),
                    PlaneSide::Straddle => {
                        let front = self.classify_child(node.front, aabb);
                        if front == Visibility::Partial {
                            return front;
                        }
                        front.merge(self.classify_child(node.back, aabb))
                    }
                }
            }
        }
    }

    fn push(&mut self, plane: Plane, front: Child, back: Child) -> Child {
        self.nodes.push(CullNode { plane, front, back });
        Child::Node(self.nodes.len() - 1)
    }

    fn rebuild(&mut self) {
        self.nodes.clear();
        let mut tail = Child::Leaf(Visibility::Visible);

        let occluders = std::mem::take(&mut self.occluders);
        for occluder in occluders.iter().rev() {
            let Some(planes) = occluder.shadow_planes(self.eye) else {
                continue;
            };
            let mut inner = Child::Leaf(Visibility::Hidden);
            for plane in planes.into_iter().rev() {
                inner = self.push(plane, inner, tail);
            }
            tail = inner;
        }
        self.occluders = occluders;

        if let Some(view_proj) = self.view_proj {
            let frustum = Frustum::from_matrix(&view_proj);
            for plane in frustum.planes.iter().rev() {
                tail = self.push(*plane, tail, Child::Leaf(Visibility::Hidden));
            }
        }

        self.root = Some(tail);
        self.dirty = false;
        self.rebuilds += 1;
        log::trace!("Cull tree rebuilt: {} nodes, {} occluders", self.nodes.len(), self.occluders.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Mat4Ext;

    fn looking_down_negative_z() -> CullTree {
        let view = Mat4::look_at(Vec3::zeros(), Vec3::new(0.0, 0.0, -1.0), Vec3::y());
        let proj = Mat4::perspective(std::f32::consts::FRAC_PI_2, 1.0, 0.1, 100.0);
        let mut tree = CullTree::new();
        tree.set_view(proj * view, Vec3::zeros());
        tree
    }

    fn cube(center: Vec3, half: f32) -> AABB {
        AABB::from_center_extents(center, Vec3::new(half, half, half))
    }

    #[test]
    fn test_frustum_classification() {
        let mut tree = looking_down_negative_z();
        assert!(tree.refresh());

        assert_eq!(tree.classify(&cube(Vec3::new(0.0, 0.0, -10.0), 1.0)), Visibility::Visible);
        assert_eq!(tree.classify(&cube(Vec3::new(0.0, 0.0, 10.0), 1.0)), Visibility::Hidden);
        // Crosses the right plane x = -z
        assert_eq!(tree.classify(&cube(Vec3::new(10.0, 0.0, -10.0), 1.0)), Visibility::Partial);
    }

    #[test]
    fn test_occluder_hides_what_is_behind_it() {
        let mut tree = looking_down_negative_z();
        // Wall facing the camera at z = -5 covering x, y in [-4, 4]
        tree.add_occluder(Occluder::new(vec![
            Vec3::new(-4.0, -4.0, -5.0),
            Vec3::new(4.0, -4.0, -5.0),
            Vec3::new(4.0, 4.0, -5.0),
            Vec3::new(-4.0, 4.0, -5.0),
        ]));
        tree.refresh();

        assert_eq!(tree.classify(&cube(Vec3::new(0.0, 0.0, -20.0), 1.0)), Visibility::Hidden);
        assert_eq!(tree.classify(&cube(Vec3::new(0.0, 0.0, -3.0), 0.5)), Visibility::Visible);
        // Pokes out past the wall's silhouette
        assert_eq!(tree.classify(&cube(Vec3::new(16.0, 0.0, -20.0), 1.0)), Visibility::Partial);
    }

    #[test]
    fn test_back_facing_occluder_is_ignored() {
        let mut tree = looking_down_negative_z();
        tree.add_occluder(Occluder::new(vec![
            Vec3::new(-4.0, 4.0, -5.0),
            Vec3::new(4.0, 4.0, -5.0),
            Vec3::new(4.0, -4.0, -5.0),
            Vec3::new(-4.0, -4.0, -5.0),
        ]));
        tree.refresh();
        assert_eq!(tree.classify(&cube(Vec3::new(0.0, 0.0, -20.0), 1.0)), Visibility::Visible);
    }

    #[test]
    fn test_rebuild_is_lazy() {
        let mut tree = looking_down_negative_z();
        assert!(tree.refresh());
        assert!(!tree.refresh());

        let view = Mat4::look_at(Vec3::zeros(), Vec3::new(0.0, 0.0, -1.0), Vec3::y());
        let proj = Mat4::perspective(std::f32::consts::FRAC_PI_2, 1.0, 0.1, 100.0);
        tree.set_view(proj * view, Vec3::zeros());
        assert!(!tree.is_dirty());

        tree.clear_occluders();
        assert!(!tree.is_dirty());
        tree.add_occluder(Occluder::new(vec![Vec3::x(), Vec3::y(), Vec3::z()]));
        assert!(tree.refresh());
        assert_eq!(tree.rebuild_count(), 2);
    }
}
