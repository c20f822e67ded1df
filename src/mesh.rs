//! The cell graph finite-volume fluxes are computed on.
//!
//! A [`Mesh`] is derived from a raw [`Triangulation`] once, before the simulation starts.
//! Every finite triangle becomes a regular cell,
//! every hull edge becomes a border cell attached to the triangle it bounds,
//! and the triangles around the well are lumped into a single well cell appended last.
//! Cell ids are dense and assigned in the triangulation's face order,
//! so identical input always produces identical ids.

/// Low-level mesh construction and corresponding tests.
mod mesh_construction;

//

use fixedbitset as fb;

use crate::{
    geometry::{Polygon, Triangulation},
    task::{Mesher, Task},
    Vec2,
};

/// Number of faces of a regular (triangle) cell.
pub const FACES: usize = 3;
/// Size of the local stencil of a regular cell: the cell itself and one neighbor per face.
pub const STENCIL: usize = FACES + 1;

/// Error in building a mesh from task geometry.
/// These are fatal and reported before any simulation step.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum MeshError {
    /// An input polygon is degenerate or self-intersecting.
    #[error("Invalid polygon: {reason}")]
    InvalidPolygon {
        /// Description of what is wrong with the polygon.
        reason: String,
    },
    /// A triangle of the triangulation has (numerically) zero area.
    #[error("Triangle {face} has zero area")]
    DegenerateTriangle {
        /// Index of the face in the triangulation's enumeration order.
        face: usize,
    },
    /// The triangulation contains no finite faces.
    #[error("The triangulation contains no triangles")]
    EmptyTriangulation,
    /// The task has no bodies to mesh.
    #[error("The task has no bodies")]
    NoBodies,
    /// No fracture cell lies within the well radius.
    #[error("No fracture cell lies within radius {radius} of the well at ({x}, {y})")]
    EmptyWell {
        /// x coordinate of the well center.
        x: f64,
        /// y coordinate of the well center.
        y: f64,
        /// Radius of the well neighborhood.
        radius: f64,
    },
    /// The spatial step of the task is not a positive finite number.
    #[error("Invalid spatial step {0}")]
    InvalidSpatialStep(f64),
}

/// Physical classification of a cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CellType {
    /// A matrix cell outside the fracture region.
    Interior,
    /// A cell whose centroid lies inside the fracture polygon.
    Fracture,
    /// A boundary edge carrying a boundary condition.
    Border,
    /// The lumped well cell,
    /// or a triangle absorbed into it.
    Well,
}

/// What a face of a regular cell is connected to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Neighbor {
    /// Another regular cell.
    Cell(usize),
    /// A border cell created for this face.
    Border(usize),
    /// The lumped well cell, through the given entry in [`Mesh::well_links`].
    Well {
        /// Id of the well cell.
        id: usize,
        /// Index of the corresponding [`WellLink`].
        link: usize,
    },
}

impl Neighbor {
    /// Id of the neighboring cell.
    #[inline]
    pub fn id(&self) -> usize {
        match *self {
            Neighbor::Cell(id) | Neighbor::Border(id) | Neighbor::Well { id, .. } => id,
        }
    }
}

/// One face (edge) of a regular cell.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Face {
    /// The cell on the other side.
    pub neighbor: Neighbor,
    /// Length of the edge.
    pub length: f64,
    /// Distance from this cell's centroid to the edge midpoint.
    pub distance: f64,
    /// Distance from the neighbor's center to the edge midpoint, as seen by the neighbor:
    /// its own centroid distance for regular cells,
    /// zero for border cells and the link distance for the well.
    pub neighbor_distance: f64,
    /// Midpoint of the edge.
    pub midpoint: Vec2,
}

/// Geometric variant of a cell.
#[derive(Clone, Debug, PartialEq)]
pub enum CellKind {
    /// A triangle of the mesh.
    Regular {
        /// One face per edge, edge `k` being opposite vertex `k`.
        faces: [Face; FACES],
        /// Indices into [`Mesh::vertices`].
        points: [usize; 3],
    },
    /// A hull edge, attached to the single triangle it bounds.
    Border {
        /// Id of the triangle.
        parent: usize,
        /// Indices into [`Mesh::vertices`].
        points: [usize; 2],
    },
    /// The lumped well. Its connections live in [`Mesh::well_links`].
    WellAggregate,
}

/// A cell in the mesh.
#[derive(Clone, Debug, PartialEq)]
pub struct Cell {
    /// Dense id, also the cell's block index in the unknown vector.
    pub id: usize,
    /// Physical classification.
    pub cell_type: CellType,
    /// Geometric variant.
    pub kind: CellKind,
    /// Triangle centroid, edge midpoint for border cells, well point for the well.
    pub centroid: Vec2,
    /// Area times height for triangles, edge length for border cells,
    /// the sum of absorbed volumes for the well.
    pub volume: f64,
    /// Elevation used in the gravity term.
    pub elevation: f64,
}

impl Cell {
    /// Faces of a regular cell, empty for other kinds.
    #[inline]
    pub fn faces(&self) -> &[Face] {
        match &self.kind {
            CellKind::Regular { faces, .. } => faces,
            _ => &[],
        }
    }

    /// Whether this is a triangle lumped into the well.
    /// Absorbed cells keep their id but only track the well state.
    #[inline]
    pub fn is_absorbed(&self) -> bool {
        self.cell_type == CellType::Well && matches!(self.kind, CellKind::Regular { .. })
    }
}

/// Connection between a cell and the well it borders.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WellLink {
    /// Id of the cell.
    pub cell: usize,
    /// Index of the cell's face that faces the well.
    pub face: usize,
    /// Length of that face.
    pub length: f64,
    /// Distance from the well center to the face midpoint.
    pub distance: f64,
}

/// Location and size of the well.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WellSpec {
    /// Well point.
    pub center: Vec2,
    /// Fracture cells with centroids closer than this are lumped into the well.
    pub radius: f64,
}

/// The cell graph of a simulation domain.
///
/// Cells are stored in contiguous ranges:
/// triangles in `0..inner_count`,
/// border cells in `inner_count..inner_count + border_count`,
/// and the well cell last.
#[derive(Clone, Debug)]
pub struct Mesh {
    cells: Vec<Cell>,
    /// Vertices referenced by the triangles, deduplicated in order of first use.
    vertices: Vec<Vec2>,
    inner_count: usize,
    border_count: usize,
    height: f64,
    /// Sum of all triangle volumes before lumping.
    total_volume: f64,
    well_volume: f64,
    well_links: Vec<WellLink>,
    /// Triangles inside the fracture polygon (including absorbed ones).
    fracture: fb::FixedBitSet,
    /// Triangles absorbed into the well.
    absorbed: fb::FixedBitSet,
}

impl Mesh {
    /// Build the cell graph from a triangulation.
    ///
    /// `height` is the thickness of the layer, multiplying triangle areas into volumes.
    /// Cells with centroids inside `fracture` are classified as fracture cells,
    /// and fracture cells within the well radius are lumped into the well.
    #[inline]
    pub fn build<T: Triangulation>(
        triangulation: &T,
        height: f64,
        well: WellSpec,
        fracture: &Polygon,
    ) -> Result<Self, MeshError> {
        mesh_construction::build_mesh(triangulation, height, well, fracture)
    }

    /// Triangulate a task with the given mesher and build the cell graph
    /// using the well and fracture of the task's first body.
    pub fn from_task<M: Mesher>(mesher: &M, task: &Task, height: f64) -> Result<Self, MeshError> {
        let body = task.primary_body()?;
        let fracture = body.fracture_polygon();
        if !fracture.is_empty() {
            Polygon::validated(fracture.points().to_vec())?;
        }
        let triangulation = mesher.triangulate(task)?;
        Self::build(&triangulation, height, body.well_spec(), &fracture)
    }

    /// Set the elevation of every cell from a function of its centroid.
    pub fn set_elevation(&mut self, elevation: impl Fn(Vec2) -> f64) {
        for cell in &mut self.cells {
            cell.elevation = elevation(cell.centroid);
        }
    }

    /// Total number of cells, including border cells and the well.
    #[inline]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether the mesh has no cells. A successfully built mesh never is.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// All cells in id order.
    #[inline]
    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    /// Get a cell by id.
    #[inline]
    pub fn cell(&self, id: usize) -> &Cell {
        &self.cells[id]
    }

    /// Vertices referenced by triangles, in order of first use.
    #[inline]
    pub fn vertices(&self) -> &[Vec2] {
        &self.vertices
    }

    /// Number of triangle cells.
    #[inline]
    pub fn inner_count(&self) -> usize {
        self.inner_count
    }

    /// Number of border cells.
    #[inline]
    pub fn border_count(&self) -> usize {
        self.border_count
    }

    /// Id range of the triangle cells.
    #[inline]
    pub fn inner_range(&self) -> std::ops::Range<usize> {
        0..self.inner_count
    }

    /// Id range of the border cells.
    #[inline]
    pub fn border_range(&self) -> std::ops::Range<usize> {
        self.inner_count..self.inner_count + self.border_count
    }

    /// Id of the well cell, which is always the last one.
    #[inline]
    pub fn well_id(&self) -> usize {
        self.cells.len() - 1
    }

    /// The well cell.
    #[inline]
    pub fn well_cell(&self) -> &Cell {
        &self.cells[self.well_id()]
    }

    /// Sum of the volumes of the absorbed cells.
    #[inline]
    pub fn well_volume(&self) -> f64 {
        self.well_volume
    }

    /// Connections from cells bordering the well to the well.
    #[inline]
    pub fn well_links(&self) -> &[WellLink] {
        &self.well_links
    }

    /// Layer thickness.
    #[inline]
    pub fn height(&self) -> f64 {
        self.height
    }

    /// Sum of all triangle volumes, i.e. the volume of the domain.
    #[inline]
    pub fn total_volume(&self) -> f64 {
        self.total_volume
    }

    /// Whether a cell was classified as a fracture cell
    /// (before any lumping into the well).
    #[inline]
    pub fn is_fracture(&self, id: usize) -> bool {
        self.fracture.contains(id)
    }

    /// Ids of the cells absorbed into the well.
    pub fn absorbed_cells(&self) -> impl Iterator<Item = usize> + '_ {
        self.absorbed.ones()
    }

    /// The cell ids a cell's equations depend on, the cell itself first.
    ///
    /// Ids may repeat, e.g. when a triangle has two faces on the well.
    pub fn stencil(&self, id: usize) -> Vec<usize> {
        let cell = &self.cells[id];
        match &cell.kind {
            CellKind::Regular { .. } if cell.is_absorbed() => vec![id, self.well_id()],
            CellKind::Regular { faces, .. } => std::iter::once(id)
                .chain(faces.iter().map(|f| f.neighbor.id()))
                .collect(),
            CellKind::Border { parent, .. } => vec![id, *parent],
            CellKind::WellAggregate => std::iter::once(id)
                .chain(self.well_links.iter().map(|l| l.cell))
                .collect(),
        }
    }
}

#[cfg(test)]
#[doc(hidden)]
pub(crate) use mesh_construction::tests::center_well_mesh;
