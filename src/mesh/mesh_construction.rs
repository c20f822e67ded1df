use fixedbitset as fb;
use std::collections::HashMap;

use super::{
    Cell, CellKind, CellType, Face, Mesh, MeshError, Neighbor, WellLink, WellSpec, FACES,
};
use crate::{
    geometry::{edge_vertices, triangle_area, Polygon, Triangulation},
    Vec2,
};

/// Triangle data gathered in the first pass,
/// before neighbors and border cells are known.
struct RawTriangle {
    points: [usize; 3],
    centroid: Vec2,
    volume: f64,
}

/// Build the cell graph from a triangulation.
///
/// Runs as a sequence of passes over the faces in enumeration order:
/// volumes and centroids, faces and border cells,
/// fracture classification, well lumping, and finally neighbor distances.
/// Classification is complete before any cell is absorbed into the well.
pub fn build_mesh<T: Triangulation>(
    tri: &T,
    height: f64,
    well: WellSpec,
    fracture_region: &Polygon,
) -> Result<Mesh, MeshError> {
    let inner_count = tri.face_count();
    if inner_count == 0 {
        return Err(MeshError::EmptyTriangulation);
    }

    //
    // volumes, centroids and vertex deduplication
    //

    let mut vertices: Vec<Vec2> = Vec::new();
    let mut vertex_map: HashMap<usize, usize> = HashMap::new();
    let mut local_vertex = |global: usize| -> usize {
        *vertex_map.entry(global).or_insert_with(|| {
            vertices.push(tri.vertex(global));
            vertices.len() - 1
        })
    };

    let mut raw: Vec<RawTriangle> = Vec::with_capacity(inner_count);
    for face in 0..inner_count {
        let [a, b, c] = tri.face_vertices(face).map(|v| tri.vertex(v));
        let area = triangle_area(a, b, c);
        let scale = [(b - a), (c - b), (a - c)]
            .iter()
            .map(|e| e.norm_squared())
            .fold(0.0, f64::max);
        if !(area > f64::EPSILON * scale) {
            return Err(MeshError::DegenerateTriangle { face });
        }

        raw.push(RawTriangle {
            points: tri.face_vertices(face).map(&mut local_vertex),
            centroid: (a + b + c) / 3.0,
            volume: area * height,
        });
    }

    //
    // faces and border cells
    //

    let mut cells: Vec<Cell> = Vec::with_capacity(inner_count);
    let mut borders: Vec<Cell> = Vec::new();
    for (face_idx, tri_data) in raw.iter().enumerate() {
        let verts = tri.face_vertices(face_idx);
        let faces: [Face; FACES] = std::array::from_fn(|edge| {
            let [v0, v1] = edge_vertices(verts, edge);
            let (p0, p1) = (tri.vertex(v0), tri.vertex(v1));
            let midpoint = 0.5 * (p0 + p1);
            let length = (p1 - p0).norm();

            let neighbor = match tri.neighbor(face_idx, edge) {
                Some(other) => Neighbor::Cell(other),
                None => {
                    let id = inner_count + borders.len();
                    let l0 = tri_data.points[(edge + 1) % 3];
                    let l1 = tri_data.points[(edge + 2) % 3];
                    borders.push(Cell {
                        id,
                        cell_type: CellType::Border,
                        kind: CellKind::Border {
                            parent: face_idx,
                            points: [l0, l1],
                        },
                        centroid: midpoint,
                        volume: length,
                        elevation: 0.0,
                    });
                    Neighbor::Border(id)
                }
            };

            Face {
                neighbor,
                length,
                distance: (tri_data.centroid - midpoint).norm(),
                // filled in once all faces exist
                neighbor_distance: 0.0,
                midpoint,
            }
        });

        cells.push(Cell {
            id: face_idx,
            cell_type: CellType::Interior,
            kind: CellKind::Regular {
                faces,
                points: tri_data.points,
            },
            centroid: tri_data.centroid,
            volume: tri_data.volume,
            elevation: 0.0,
        });
    }
    let border_count = borders.len();
    let well_id = inner_count + border_count;

    //
    // fracture classification
    //

    let mut fracture = fb::FixedBitSet::with_capacity(inner_count);
    for cell in &mut cells {
        if fracture_region.contains(cell.centroid) {
            cell.cell_type = CellType::Fracture;
            fracture.insert(cell.id);
        }
    }

    //
    // well lumping
    //

    let mut absorbed = fb::FixedBitSet::with_capacity(inner_count);
    for id in fracture.ones() {
        if (cells[id].centroid - well.center).norm() < well.radius {
            absorbed.insert(id);
        }
    }
    if absorbed.count_ones(..) == 0 {
        return Err(MeshError::EmptyWell {
            x: well.center.x,
            y: well.center.y,
            radius: well.radius,
        });
    }

    let mut well_volume = 0.0;
    for id in absorbed.ones() {
        cells[id].cell_type = CellType::Well;
        well_volume += cells[id].volume;
    }

    let mut well_links: Vec<WellLink> = Vec::new();
    for cell in cells.iter_mut().filter(|c| !absorbed.contains(c.id)) {
        let cell_id = cell.id;
        let CellKind::Regular { faces, .. } = &mut cell.kind else {
            continue;
        };
        for (face_idx, face) in faces.iter_mut().enumerate() {
            let Neighbor::Cell(other) = face.neighbor else {
                continue;
            };
            if !absorbed.contains(other) {
                continue;
            }
            let link = well_links.len();
            well_links.push(WellLink {
                cell: cell_id,
                face: face_idx,
                length: face.length,
                distance: (well.center - face.midpoint).norm(),
            });
            face.neighbor = Neighbor::Well { id: well_id, link };
        }
    }

    //
    // neighbor distances
    //

    let own_distances: Vec<[f64; FACES]> = cells
        .iter()
        .map(|c| std::array::from_fn(|k| c.faces()[k].distance))
        .collect();
    let own_neighbors: Vec<[Option<usize>; FACES]> = (0..inner_count)
        .map(|f| std::array::from_fn(|k| tri.neighbor(f, k)))
        .collect();
    for cell in &mut cells {
        let cell_id = cell.id;
        let CellKind::Regular { faces, .. } = &mut cell.kind else {
            continue;
        };
        for face in faces.iter_mut() {
            face.neighbor_distance = match face.neighbor {
                Neighbor::Cell(other) => own_neighbors[other]
                    .iter()
                    .position(|n| *n == Some(cell_id))
                    .map_or(face.distance, |k| own_distances[other][k]),
                Neighbor::Border(_) => 0.0,
                Neighbor::Well { link, .. } => well_links[link].distance,
            };
        }
    }

    let total_volume = cells.iter().map(|c| c.volume).sum();

    cells.extend(borders);
    cells.push(Cell {
        id: well_id,
        cell_type: CellType::Well,
        kind: CellKind::WellAggregate,
        centroid: well.center,
        volume: well_volume,
        elevation: 0.0,
    });

    log::debug!(
        "built mesh: {inner_count} triangles ({} fracture, {} in well), {border_count} border cells, {} well links",
        fracture.count_ones(..),
        absorbed.count_ones(..),
        well_links.len(),
    );

    Ok(Mesh {
        cells,
        vertices,
        inner_count,
        border_count,
        height,
        total_volume,
        well_volume,
        well_links,
        fracture,
        absorbed,
    })
}

//
// tests
//
