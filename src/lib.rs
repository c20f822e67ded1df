//! Finite-volume simulation of multiphase flow in porous media
//! on unstructured 2D triangle meshes.
//!
//! A triangulation of the task geometry is turned into a cell graph
//! ([`Mesh`]) with border cells and a single lumped well cell.
//! Every time step is solved fully implicitly with Newton-Raphson iteration:
//! per-cell residuals are written once over the [`Scalar`][autodiff::Scalar] trait
//! and differentiated automatically with [`num_dual`] dual numbers,
//! scattered into a sparse system on a fixed sparsity pattern
//! and solved with a preconditioned iterative solver.
//! A [`TimeStepController`] adapts the step size and steps through
//! periods of rate or pressure controlled well operation.
//!
//! [`Simulator`] ties these together for a given [`FluidModel`].

#![warn(missing_docs)]

pub mod geometry;
#[doc(inline)]
pub use geometry::{Polygon, TriMesh, Triangulation};

pub mod task;
#[doc(inline)]
pub use task::{Body, Mesher, StructuredMesher, Task};

pub mod gmsh;

pub mod mesh;
#[doc(inline)]
pub use mesh::{Cell, CellType, Mesh, MeshError, WellSpec};

pub mod state;
#[doc(inline)]
pub use state::StateStore;

pub mod autodiff;

pub mod table;

pub mod model;
#[doc(inline)]
pub use model::{FluidModel, OilModel, WaterOilModel};

pub mod assembly;

pub mod linear;

pub mod newton;
#[doc(inline)]
pub use newton::{NewtonDriver, NonlinearSystem};

pub mod controller;
#[doc(inline)]
pub use controller::{Period, TimeStepController, WellControl};

pub mod config;
#[doc(inline)]
pub use config::SimulationConfig;

pub mod simulation;
#[doc(inline)]
pub use simulation::{SimulationError, Simulator};

// nalgebra re-exports of common types for convenience

pub use nalgebra as na;
/// Type alias for a 2D `nalgebra` vector.
pub type Vec2 = na::Vector2<f64>;
