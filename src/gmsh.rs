//! Loading triangulations generated with [`gmsh`](https://www.gmsh.info/).
//!
//! Only version 4.1 of the MSH format is supported,
//! as per the [`mshio`] library.
//! The result is a [`TriMesh`] usable as the input of [`Mesh::build`][crate::mesh::Mesh::build]
//! in place of a [`Mesher`][crate::task::Mesher].

use crate::{geometry::TriMesh, Vec2};

/// Error in loading a triangulation from a Gmsh .msh file.
#[derive(thiserror::Error, Debug)]
pub enum GmshError {
    /// Error parsing the .msh file.
    ///
    /// (the parser error is converted to a string
    /// because it borrows the input bytes)
    #[error("Parsing the .msh data failed: {0}")]
    ParseError(String),
    /// The file contains no nodes.
    #[error("Invalid .msh data: no nodes")]
    MissingNodes,
    /// The file contains no `Tri3` elements.
    #[error("Invalid .msh data: no triangle elements")]
    MissingElements,
    /// An element refers to a node tag that isn't defined.
    #[error("Invalid .msh data: unknown node tag {0}")]
    UnknownNode(u64),
}

/// Load a planar triangulation from the bytes of a `.msh` file.
///
/// First-order triangle elements (`Tri3`, see [`ElementType`][mshio::ElementType])
/// become the faces of the triangulation; other elements are ignored.
/// The `z` coordinate of nodes is dropped.
/// Node tags must be numbered sequentially from 1 in the order the nodes appear.
pub fn load_triangulation(bytes: &[u8]) -> Result<TriMesh, GmshError> {
    let msh = mshio::parse_msh_bytes(bytes).map_err(|e| GmshError::ParseError(format!("{e}")))?;
    let nodes = msh.data.nodes.ok_or(GmshError::MissingNodes)?;
    let elements = msh.data.elements.ok_or(GmshError::MissingElements)?;

    let vertices: Vec<Vec2> = nodes
        .node_blocks
        .iter()
        .flat_map(|block| block.nodes.iter())
        .map(|node| Vec2::new(node.x, node.y))
        .collect();
    if vertices.is_empty() {
        return Err(GmshError::MissingNodes);
    }

    let indices = elements
        .element_blocks
        .iter()
        .filter(|block| block.element_type == mshio::ElementType::Tri3)
        .flat_map(|block| block.elements.iter())
        .flat_map(|el| el.nodes.iter())
        // gmsh tags start at 1 and are assumed sequential in file order
        .map(|&tag| {
            match (tag as usize).checked_sub(1) {
                Some(idx) if idx < vertices.len() => Ok(idx),
                _ => Err(GmshError::UnknownNode(tag)),
            }
        })
        .collect::<Result<Vec<usize>, _>>()?;
    if indices.is_empty() {
        return Err(GmshError::MissingElements);
    }

    log::debug!(
        "loaded {} vertices and {} triangles from .msh data",
        vertices.len(),
        indices.len() / 3
    );
    Ok(TriMesh::new(vertices, indices))
}
