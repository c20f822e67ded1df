//! Task input: the bodies to be meshed, their wells and fracture constraints,
//! and a simple deterministic mesher producing a [`TriMesh`] from them.

use crate::{
    geometry::{Polygon, TriMesh},
    mesh::{MeshError, WellSpec},
    Vec2,
};

/// One connected body of the simulation domain.
#[derive(Clone, Debug, PartialEq)]
pub struct Body {
    /// Outer border of the body.
    pub outer: Polygon,
    /// Borders of inner cavities, which are left out of the mesh.
    pub inner: Vec<Polygon>,
    /// Center point of the well.
    pub well: Vec2,
    /// Radius of the well neighborhood lumped into a single cell.
    pub well_radius: f64,
    /// Constraint edges outlining the fracture region.
    pub constraint: Vec<(Vec2, Vec2)>,
}

impl Body {
    /// The closed polygon formed by the constraint edges,
    /// taking the first point of every edge in order.
    pub fn fracture_polygon(&self) -> Polygon {
        self.constraint.iter().map(|(first, _)| *first).collect()
    }

    /// The well of this body.
    #[inline]
    pub fn well_spec(&self) -> WellSpec {
        WellSpec {
            center: self.well,
            radius: self.well_radius,
        }
    }
}

/// Everything needed to build a mesh.
#[derive(Clone, Debug, PartialEq)]
pub struct Task {
    /// Target edge length of the triangulation.
    pub spatial_step: f64,
    /// The bodies making up the domain.
    /// The well and fracture of the first body are the ones simulated.
    pub bodies: Vec<Body>,
}

impl Task {
    /// The primary body, whose well and fracture are simulated.
    pub fn primary_body(&self) -> Result<&Body, MeshError> {
        self.bodies.first().ok_or(MeshError::NoBodies)
    }
}

/// Something that turns a task into a finite triangulation.
///
/// Delaunay meshers and file loaders plug in here;
/// the mesh topology only needs the resulting [`Triangulation`
/// ][crate::geometry::Triangulation].
pub trait Mesher {
    /// The triangulation type produced.
    type Output: crate::geometry::Triangulation;

    /// Triangulate every body of the task.
    fn triangulate(&self, task: &Task) -> Result<Self::Output, MeshError>;
}

/// A mesher laying a regular grid of squares over each body,
/// splitting every square into four triangles through its center:
///
/// ```text
///  ______
/// |\    /|
/// |  \/  |
/// |  /\  |
/// |/____\|
/// ```
///
/// Squares whose center lies outside the outer border
/// or inside a cavity are dropped.
/// Triangles are emitted square by square, bottom row first,
/// each square in the order bottom, right, top, left.
#[derive(Clone, Copy, Debug, Default)]
pub struct StructuredMesher;

impl Mesher for StructuredMesher {
    type Output = TriMesh;

    fn triangulate(&self, task: &Task) -> Result<TriMesh, MeshError> {
        if !(task.spatial_step.is_finite() && task.spatial_step > 0.0) {
            return Err(MeshError::InvalidSpatialStep(task.spatial_step));
        }

        let mut vertices: Vec<Vec2> = Vec::new();
        let mut indices: Vec<usize> = Vec::new();

        for body in &task.bodies {
            let outer = Polygon::validated(body.outer.points().to_vec())?;
            let inner = body
                .inner
                .iter()
                .map(|cavity| Polygon::validated(cavity.points().to_vec()))
                .collect::<Result<Vec<_>, _>>()?;

            let (min, max) = outer.bounding_box();
            let extent = max - min;
            let nx = ((extent.x / task.spatial_step).ceil() as usize).max(1);
            let ny = ((extent.y / task.spatial_step).ceil() as usize).max(1);
            let dx = extent.x / nx as f64;
            let dy = extent.y / ny as f64;

            // grid corners first, then square centers
            let corner_base = vertices.len();
            for j in 0..=ny {
                for i in 0..=nx {
                    vertices.push(min + Vec2::new(i as f64 * dx, j as f64 * dy));
                }
            }
            let corner = |i: usize, j: usize| corner_base + j * (nx + 1) + i;

            for j in 0..ny {
                for i in 0..nx {
                    let center = min + Vec2::new((i as f64 + 0.5) * dx, (j as f64 + 0.5) * dy);
                    if !outer.contains(center) || inner.iter().any(|c| c.contains(center)) {
                        continue;
                    }
                    let mid = vertices.len();
                    vertices.push(center);

                    let (bl, br) = (corner(i, j), corner(i + 1, j));
                    let (tl, tr) = (corner(i, j + 1), corner(i + 1, j + 1));
                    #[rustfmt::skip]
                    indices.extend_from_slice(&[
                        bl, br, mid,
                        br, tr, mid,
                        tr, tl, mid,
                        tl, bl, mid,
                    ]);
                }
            }
        }

        if indices.is_empty() {
            return Err(MeshError::EmptyTriangulation);
        }
        Ok(TriMesh::new(vertices, indices))
    }
}

/// A square body `[0, side]²` with a square fracture region
/// and a well at its center, for tests and examples.
///
/// `fracture_half_width` is measured from the center of the square.
#[doc(hidden)]
pub fn square_task(side: f64, spatial_step: f64, fracture_half_width: f64, well_radius: f64) -> Task {
    rectangle_task(side, side, spatial_step, fracture_half_width, well_radius)
}

/// A rectangular body `[0, width] × [0, height]`
/// with a square fracture region and a well at its center.
#[doc(hidden)]
pub fn rectangle_task(
    width: f64,
    height: f64,
    spatial_step: f64,
    fracture_half_width: f64,
    well_radius: f64,
) -> Task {
    let rect = |lo: Vec2, hi: Vec2| {
        vec![
            Vec2::new(lo.x, lo.y),
            Vec2::new(hi.x, lo.y),
            Vec2::new(hi.x, hi.y),
            Vec2::new(lo.x, hi.y),
        ]
    };
    let c = Vec2::new(0.5 * width, 0.5 * height);
    let half = Vec2::new(fracture_half_width, fracture_half_width);
    let frac = rect(c - half, c + half);
    let constraint = (0..frac.len())
        .map(|i| (frac[i], frac[(i + 1) % frac.len()]))
        .collect();

    Task {
        spatial_step,
        bodies: vec![Body {
            outer: Polygon::new(rect(Vec2::zeros(), Vec2::new(width, height))),
            inner: Vec::new(),
            well: c,
            well_radius,
            constraint,
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{triangle_area, Triangulation};

    #[test]
    fn structured_mesher_covers_the_body() {
        let task = square_task(3.0, 1.0, 0.6, 0.4);
        let tri = StructuredMesher.triangulate(&task).unwrap();

        assert_eq!(tri.face_count(), 36);
        let area: f64 = (0..tri.face_count())
            .map(|f| {
                let [a, b, c] = tri.face_vertices(f).map(|v| tri.vertex(v));
                triangle_area(a, b, c)
            })
            .sum();
        approx::assert_relative_eq!(area, 9.0, epsilon = 1e-12);

        // hull edges: 3 squares per side, 4 sides
        let hull_edges = (0..tri.face_count())
            .flat_map(|f| (0..3).map(move |e| (f, e)))
            .filter(|&(f, e)| tri.neighbor(f, e).is_none())
            .count();
        assert_eq!(hull_edges, 12);
    }

    #[test]
    fn task_without_bodies_is_rejected() {
        let task = Task {
            spatial_step: 1.0,
            bodies: Vec::new(),
        };
        assert_eq!(task.primary_body(), Err(MeshError::NoBodies));
        assert!(matches!(
            crate::mesh::Mesh::from_task(&StructuredMesher, &task, 1.0),
            Err(MeshError::NoBodies)
        ));
    }

    #[test]
    fn cavities_are_left_out() {
        let mut task = square_task(4.0, 1.0, 0.5, 0.1);
        task.bodies[0].inner.push(Polygon::new(vec![
            Vec2::new(1.0, 1.0),
            Vec2::new(2.0, 1.0),
            Vec2::new(2.0, 2.0),
            Vec2::new(1.0, 2.0),
        ]));
        let tri = StructuredMesher.triangulate(&task).unwrap();
        assert_eq!(tri.face_count(), 4 * 15);
    }

    #[test]
    fn bad_input_is_rejected() {
        let mut task = square_task(1.0, 0.0, 0.1, 0.1);
        assert!(matches!(
            StructuredMesher.triangulate(&task),
            Err(MeshError::InvalidSpatialStep(_))
        ));

        task.spatial_step = 0.5;
        task.bodies[0].outer = Polygon::new(vec![
            Vec2::new(0.0, 0.0),
            Vec2::new(1.0, 1.0),
            Vec2::new(1.0, 0.0),
            Vec2::new(0.0, 1.0),
        ]);
        assert!(matches!(
            StructuredMesher.triangulate(&task),
            Err(MeshError::InvalidPolygon { .. })
        ));
    }

    #[test]
    fn fracture_polygon_from_constraints() {
        let task = square_task(2.0, 0.5, 0.5, 0.1);
        let frac = task.bodies[0].fracture_polygon();
        assert_eq!(frac.points().len(), 4);
        assert!(frac.contains(Vec2::new(1.0, 1.0)));
        assert!(!frac.contains(Vec2::new(0.2, 0.2)));
    }
}
