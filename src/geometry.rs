//! The geometry adapter the mesh topology is built from:
//! a finite planar triangulation with vertex and face-neighbor queries,
//! plus the handful of geometric predicates needed during construction.

use itertools::Itertools;
use std::collections::HashMap;

use crate::{mesh::MeshError, Vec2};

/// Query access to a finite planar triangulation.
///
/// Faces are enumerated in a fixed order,
/// which the mesh topology relies on to assign cell ids deterministically.
/// Edge `k` of a face is the edge opposite its `k`th vertex,
/// i.e. the edge between vertices `k + 1` and `k + 2` (mod 3).
pub trait Triangulation {
    /// Number of vertices in the triangulation.
    fn vertex_count(&self) -> usize;
    /// Position of a vertex.
    fn vertex(&self, idx: usize) -> Vec2;
    /// Number of finite faces.
    fn face_count(&self) -> usize;
    /// Vertex indices of a finite face.
    fn face_vertices(&self, face: usize) -> [usize; 3];
    /// The finite face across edge `edge` of `face`,
    /// or `None` if the edge lies on the hull of the triangulation
    /// (i.e. the neighbor is the infinite face).
    fn neighbor(&self, face: usize, edge: usize) -> Option<usize>;
}

/// Vertex indices of edge `edge` of a face, in counterclockwise order.
#[inline]
pub fn edge_vertices(face: [usize; 3], edge: usize) -> [usize; 2] {
    [face[(edge + 1) % 3], face[(edge + 2) % 3]]
}

/// A triangulation stored as plain vertex and index arrays,
/// with face adjacency derived from shared edges.
#[derive(Clone, Debug)]
pub struct TriMesh {
    vertices: Vec<Vec2>,
    faces: Vec<[usize; 3]>,
    neighbors: Vec<[Option<usize>; 3]>,
}

impl TriMesh {
    /// Construct a triangulation from raw vertices and indices.
    ///
    /// The indices are given as a flat array
    /// where every 3 indices correspond to one triangle.
    /// Triangles are reoriented counterclockwise if needed.
    pub fn new(vertices: Vec<Vec2>, indices: Vec<usize>) -> Self {
        let faces: Vec<[usize; 3]> = indices
            .chunks_exact(3)
            .map(|tri| {
                let [a, b, c] = [tri[0], tri[1], tri[2]];
                if orient2d(vertices[a], vertices[b], vertices[c]) < 0.0 {
                    [a, c, b]
                } else {
                    [a, b, c]
                }
            })
            .collect();

        // an edge is identified by its sorted vertex pair.
        // the first face to claim an edge waits here until its partner shows up
        let mut open_edges: HashMap<(usize, usize), (usize, usize)> = HashMap::new();
        let mut neighbors = vec![[None; 3]; faces.len()];
        for (face_idx, face) in faces.iter().enumerate() {
            for edge in 0..3 {
                let [v0, v1] = edge_vertices(*face, edge);
                let key = (v0.min(v1), v0.max(v1));
                match open_edges.remove(&key) {
                    Some((other_face, other_edge)) => {
                        neighbors[face_idx][edge] = Some(other_face);
                        neighbors[other_face][other_edge] = Some(face_idx);
                    }
                    None => {
                        open_edges.insert(key, (face_idx, edge));
                    }
                }
            }
        }

        Self {
            vertices,
            faces,
            neighbors,
        }
    }

    /// Get a slice of all vertices.
    #[inline]
    pub fn vertices(&self) -> &[Vec2] {
        &self.vertices
    }

    /// Get a slice of all faces as vertex index triples.
    #[inline]
    pub fn faces(&self) -> &[[usize; 3]] {
        &self.faces
    }
}

impl Triangulation for TriMesh {
    fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    fn vertex(&self, idx: usize) -> Vec2 {
        self.vertices[idx]
    }

    fn face_count(&self) -> usize {
        self.faces.len()
    }

    fn face_vertices(&self, face: usize) -> [usize; 3] {
        self.faces[face]
    }

    fn neighbor(&self, face: usize, edge: usize) -> Option<usize> {
        self.neighbors[face][edge]
    }
}

//
// predicates
//

/// Twice the signed area of the triangle `abc`,
/// positive if the points are in counterclockwise order.
#[inline]
pub fn orient2d(a: Vec2, b: Vec2, c: Vec2) -> f64 {
    (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x)
}

/// Unsigned area of the triangle `abc`.
#[inline]
pub fn triangle_area(a: Vec2, b: Vec2, c: Vec2) -> f64 {
    0.5 * orient2d(a, b, c).abs()
}

/// Whether the closed segments `p0p1` and `q0q1` share at least one point.
pub fn segments_intersect(p0: Vec2, p1: Vec2, q0: Vec2, q1: Vec2) -> bool {
    let d1 = orient2d(q0, q1, p0);
    let d2 = orient2d(q0, q1, p1);
    let d3 = orient2d(p0, p1, q0);
    let d4 = orient2d(p0, p1, q1);

    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }

    // collinear cases: an endpoint lying on the other segment
    (d1 == 0.0 && on_segment(q0, q1, p0))
        || (d2 == 0.0 && on_segment(q0, q1, p1))
        || (d3 == 0.0 && on_segment(p0, p1, q0))
        || (d4 == 0.0 && on_segment(p0, p1, q1))
}

/// For a point known to be collinear with `ab`, whether it lies between them.
fn on_segment(a: Vec2, b: Vec2, p: Vec2) -> bool {
    p.x >= a.x.min(b.x) && p.x <= a.x.max(b.x) && p.y >= a.y.min(b.y) && p.y <= a.y.max(b.y)
}

/// Distance from a point to the closed segment `ab`.
pub fn segment_distance(a: Vec2, b: Vec2, p: Vec2) -> f64 {
    let ab = b - a;
    let len_sq = ab.norm_squared();
    if len_sq == 0.0 {
        return (p - a).norm();
    }
    let t = ((p - a).dot(&ab) / len_sq).clamp(0.0, 1.0);
    (p - (a + t * ab)).norm()
}

/// A closed polygon given by its corner points.
/// The closing edge from the last point back to the first is implicit.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Polygon {
    points: Vec<Vec2>,
}

impl Polygon {
    /// Tolerance for treating a point as lying on the polygon boundary.
    const BOUNDARY_EPS: f64 = 1e-12;

    /// Create a polygon without validity checks.
    /// An empty polygon contains no points.
    pub fn new(points: Vec<Vec2>) -> Self {
        Self { points }
    }

    /// Create a polygon, checking that it has at least three corners,
    /// a nonzero area and no self-intersections.
    pub fn validated(points: Vec<Vec2>) -> Result<Self, MeshError> {
        let poly = Self::new(points);
        if poly.points.len() < 3 {
            return Err(MeshError::InvalidPolygon {
                reason: format!("{} points, at least 3 required", poly.points.len()),
            });
        }
        if poly.signed_area().abs() <= f64::EPSILON {
            return Err(MeshError::InvalidPolygon {
                reason: "zero area".to_string(),
            });
        }
        if !poly.is_simple() {
            return Err(MeshError::InvalidPolygon {
                reason: "self-intersecting boundary".to_string(),
            });
        }
        Ok(poly)
    }

    /// Corner points of the polygon.
    #[inline]
    pub fn points(&self) -> &[Vec2] {
        &self.points
    }

    /// Whether the polygon has no corners at all.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Iterate over the edges of the polygon, including the closing edge.
    pub fn edges(&self) -> impl Iterator<Item = (Vec2, Vec2)> + '_ {
        self.points
            .iter()
            .circular_tuple_windows()
            .map(|(a, b)| (*a, *b))
    }

    /// Signed area by the shoelace formula, positive for counterclockwise polygons.
    pub fn signed_area(&self) -> f64 {
        0.5 * self
            .edges()
            .map(|(a, b)| a.x * b.y - b.x * a.y)
            .sum::<f64>()
    }

    /// Axis-aligned bounding box as `(min, max)` corners.
    pub fn bounding_box(&self) -> (Vec2, Vec2) {
        let mut min = Vec2::repeat(f64::INFINITY);
        let mut max = Vec2::repeat(f64::NEG_INFINITY);
        for p in &self.points {
            min = min.inf(p);
            max = max.sup(p);
        }
        (min, max)
    }

    /// Whether no two non-adjacent edges of the polygon intersect.
    pub fn is_simple(&self) -> bool {
        let edges: Vec<(Vec2, Vec2)> = self.edges().collect();
        let n = edges.len();
        for i in 0..n {
            for j in (i + 1)..n {
                let adjacent = j == i + 1 || (i == 0 && j == n - 1);
                if adjacent {
                    continue;
                }
                let (p0, p1) = edges[i];
                let (q0, q1) = edges[j];
                if segments_intersect(p0, p1, q0, q1) {
                    return false;
                }
            }
        }
        true
    }

    /// Whether a point lies inside the polygon or on its boundary.
    pub fn contains(&self, p: Vec2) -> bool {
        if self.points.len() < 3 {
            return false;
        }
        if self
            .edges()
            .any(|(a, b)| segment_distance(a, b, p) <= Self::BOUNDARY_EPS)
        {
            return true;
        }

        // crossing number test
        let mut inside = false;
        for (a, b) in self.edges() {
            if (a.y > p.y) != (b.y > p.y) {
                let x_cross = a.x + (p.y - a.y) / (b.y - a.y) * (b.x - a.x);
                if p.x < x_cross {
                    inside = !inside;
                }
            }
        }
        inside
    }
}

impl FromIterator<Vec2> for Polygon {
    fn from_iter<I: IntoIterator<Item = Vec2>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_square() -> Polygon {
        Polygon::new(vec![
            Vec2::new(0.0, 0.0),
            Vec2::new(1.0, 0.0),
            Vec2::new(1.0, 1.0),
            Vec2::new(0.0, 1.0),
        ])
    }

    /// Shared edges between triangles are found,
    /// and hull edges have no neighbor.
    #[test]
    fn trimesh_adjacency_is_symmetric() {
        // two triangles splitting the unit square along the diagonal 0-2,
        // the second one given in clockwise order to test reorientation
        let vertices = vec![
            Vec2::new(0.0, 0.0),
            Vec2::new(1.0, 0.0),
            Vec2::new(1.0, 1.0),
            Vec2::new(0.0, 1.0),
        ];
        let tri = TriMesh::new(vertices, vec![0, 1, 2, 0, 3, 2]);

        assert_eq!(tri.face_count(), 2);
        assert_eq!(tri.face_vertices(1), [0, 2, 3], "face not reoriented");

        // edge opposite vertex 1 of face 0 is the diagonal
        assert_eq!(tri.neighbor(0, 1), Some(1));
        assert_eq!(tri.neighbor(0, 0), None);
        assert_eq!(tri.neighbor(0, 2), None);
        // in face 1 the diagonal is opposite vertex 3, at position 2
        assert_eq!(tri.neighbor(1, 2), Some(0));
        assert_eq!(
            tri.neighbor(1, 0).into_iter().chain(tri.neighbor(1, 1)).count(),
            0
        );
    }

    #[test]
    fn point_in_polygon() {
        let square = unit_square();
        assert!(square.contains(Vec2::new(0.5, 0.5)));
        assert!(square.contains(Vec2::new(1.0, 0.5)), "boundary is inside");
        assert!(!square.contains(Vec2::new(1.5, 0.5)));
        assert!(!square.contains(Vec2::new(-0.1, 0.9)));
        assert!(!Polygon::default().contains(Vec2::zeros()));

        // a concave L-shape
        let ell = Polygon::new(vec![
            Vec2::new(0.0, 0.0),
            Vec2::new(2.0, 0.0),
            Vec2::new(2.0, 1.0),
            Vec2::new(1.0, 1.0),
            Vec2::new(1.0, 2.0),
            Vec2::new(0.0, 2.0),
        ]);
        assert!(ell.contains(Vec2::new(0.5, 1.5)));
        assert!(!ell.contains(Vec2::new(1.5, 1.5)));
    }

    #[test]
    fn invalid_polygons_are_rejected() {
        assert!(Polygon::validated(unit_square().points().to_vec()).is_ok());

        let bow_tie = vec![
            Vec2::new(0.0, 0.0),
            Vec2::new(1.0, 1.0),
            Vec2::new(1.0, 0.0),
            Vec2::new(0.0, 1.0),
        ];
        assert!(matches!(
            Polygon::validated(bow_tie),
            Err(MeshError::InvalidPolygon { .. })
        ));

        let collinear = vec![
            Vec2::new(0.0, 0.0),
            Vec2::new(1.0, 0.0),
            Vec2::new(2.0, 0.0),
        ];
        assert!(Polygon::validated(collinear).is_err());
        assert!(Polygon::validated(vec![Vec2::zeros(); 2]).is_err());
    }

    #[test]
    fn polygon_area_and_bounds() {
        let square = unit_square();
        approx::assert_relative_eq!(square.signed_area(), 1.0);
        let (min, max) = square.bounding_box();
        assert_eq!(min, Vec2::new(0.0, 0.0));
        assert_eq!(max, Vec2::new(1.0, 1.0));
        approx::assert_relative_eq!(
            segment_distance(Vec2::new(0.0, 0.0), Vec2::new(1.0, 0.0), Vec2::new(2.0, 1.0)),
            2.0f64.sqrt()
        );
    }
}
