//! The time loop tying mesh, fluid model, solvers and controller together.

use crate::{
    assembly::{FlowSystem, GlobalAssembler, LocalAssembler, StepContext, WellTarget},
    config::SimulationConfig,
    controller::{ControlError, Period, TimeStepController},
    linear::{BiCgStab, LinearSolver},
    mesh::{Cell, Mesh, MeshError},
    model::{FluidModel, PRESSURE},
    newton::{NewtonDriver, NewtonFailure},
    state::{CellSnapshot, StateStore},
    task::{Mesher, Task},
};

/// Fatal error that halts a simulation.
#[derive(thiserror::Error, Debug)]
pub enum SimulationError {
    /// The mesh could not be built.
    #[error(transparent)]
    Mesh(#[from] MeshError),
    /// The schedule was rejected.
    #[error(transparent)]
    Control(#[from] ControlError),
    /// A time step failed at the smallest step size.
    #[error("Time step from t = {time} in period {period} did not converge (cell {cell:?}): {cause}")]
    NonConvergence {
        /// Index of the active period.
        period: usize,
        /// Time the step started from.
        time: f64,
        /// Cell the failure is attributed to, if known.
        cell: Option<usize>,
        /// Why the last attempt failed.
        #[source]
        cause: NewtonFailure,
    },
    /// Stepping was attempted past the end of the last period.
    #[error("The simulation has already reached its end time")]
    Finished,
}

/// Summary of a completed time step.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepReport {
    /// Period the step belonged to.
    pub period: usize,
    /// Time at the end of the step.
    pub time: f64,
    /// Size of the step.
    pub step: f64,
    /// Newton iterations of the successful attempt.
    pub iterations: usize,
    /// Failed attempts with larger steps before it.
    pub retries: usize,
}

/// Pressure and flow at the well.
#[derive(Clone, Debug, PartialEq)]
pub struct WellReport {
    /// Current time.
    pub time: f64,
    /// Pressure of the well cell.
    pub pressure: f64,
    /// Production rate of every phase through every well link,
    /// negative for injection.
    pub link_rates: Vec<Vec<f64>>,
    /// Production rate of every phase summed over the links.
    pub total_rates: Vec<f64>,
    /// Total rate assigned to every link by the time step controller
    /// in rate-controlled periods, `None` under pressure control.
    /// Only their sum enters the well equation;
    /// `link_rates` is the split the flow actually takes.
    pub target_link_rates: Option<Vec<f64>>,
}

/// Flow simulation on one mesh with one fluid model.
pub struct Simulator<M> {
    mesh: Mesh,
    model: M,
    config: SimulationConfig,
    state: StateStore,
    global: GlobalAssembler,
    controller: TimeStepController,
    newton: NewtonDriver,
    solver: Box<dyn LinearSolver + Send>,
}

impl<M: FluidModel> Simulator<M> {
    /// Set up a simulation starting from the model's initial state
    /// with a BiCGStab linear solver.
    pub fn new(
        mesh: Mesh,
        model: M,
        periods: Vec<Period>,
        config: SimulationConfig,
    ) -> Result<Self, SimulationError> {
        let var_count = model.var_count();
        let state = StateStore::new(mesh.len(), &model.initial_state());
        let global = GlobalAssembler::from_mesh(&mesh, var_count);
        let link_lengths = mesh.well_links().iter().map(|l| l.length).collect();
        let controller = TimeStepController::new(config.time.clone(), periods, link_lengths)?;
        let newton = NewtonDriver::new(config.newton.clone())
            .with_preconditioners(config.linear.preconditioner, config.linear.fallback);
        let solver = Box::new(BiCgStab::new(config.linear.clone()));

        log::info!(
            "Simulation of {} cells, {} unknowns, {} nonzeros",
            mesh.len(),
            global.dim(),
            global.nnz()
        );
        Ok(Self {
            mesh,
            model,
            config,
            state,
            global,
            controller,
            newton,
            solver,
        })
    }

    /// Mesh a task and set up a simulation on the result.
    pub fn from_task<T: Mesher>(
        mesher: &T,
        task: &Task,
        height: f64,
        model: M,
        periods: Vec<Period>,
        config: SimulationConfig,
    ) -> Result<Self, SimulationError> {
        let mesh = Mesh::from_task(mesher, task, height)?;
        Self::new(mesh, model, periods, config)
    }

    /// Replace the linear solver.
    pub fn with_solver(mut self, solver: impl LinearSolver + Send + 'static) -> Self {
        self.solver = Box::new(solver);
        self
    }

    /// Set the state of every cell from a function of the cell.
    ///
    /// Cells absorbed into the well take the well cell's state.
    pub fn set_initial_state(&mut self, init: impl Fn(&Cell) -> Vec<f64>) {
        for cell in self.mesh.cells() {
            self.state.set_cell(cell.id, &init(cell));
        }
        let well = self.state.next(self.mesh.well_id()).to_vec();
        for id in self.mesh.absorbed_cells() {
            self.state.set_cell(id, &well);
        }
    }

    /// The mesh.
    #[inline]
    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    /// The fluid model.
    #[inline]
    pub fn model(&self) -> &M {
        &self.model
    }

    /// The configuration the simulation was set up with.
    #[inline]
    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Cell states.
    #[inline]
    pub fn state(&self) -> &StateStore {
        &self.state
    }

    /// Period and step size state.
    #[inline]
    pub fn controller(&self) -> &TimeStepController {
        &self.controller
    }

    /// Current simulated time.
    #[inline]
    pub fn time(&self) -> f64 {
        self.controller.time()
    }

    /// Whether the end of the last period has been reached.
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.controller.is_finished()
    }

    /// Advance by one time step,
    /// retrying with smaller steps until one converges.
    pub fn step(&mut self) -> Result<StepReport, SimulationError> {
        if self.controller.is_finished() {
            return Err(SimulationError::Finished);
        }

        let mut retries = 0;
        loop {
            let step = self.controller.next_step();
            let ctx = StepContext {
                ht: step,
                well: self.controller.well_target(),
                border: self.config.border,
                gravity: self.config.gravity,
            };
            let mut system =
                FlowSystem::new(LocalAssembler::new(&self.mesh, &self.model), &self.global, ctx);
            let result = self
                .newton
                .solve(&mut system, &mut self.state, self.solver.as_mut());

            match result {
                Ok(newton) => {
                    self.state.commit();
                    let period = self.controller.period_index();
                    self.controller.on_converged(step, newton.iterations);
                    let report = StepReport {
                        period,
                        time: self.controller.time(),
                        step,
                        iterations: newton.iterations,
                        retries,
                    };
                    log::info!(
                        "t = {:.6}, ht = {step:.3e}, {} Newton iterations",
                        report.time,
                        report.iterations
                    );
                    return Ok(report);
                }
                Err(failure) => {
                    self.state.rollback();
                    log::warn!(
                        "Newton solve failed at t = {} with step {step:e}: {failure}",
                        self.controller.time()
                    );
                    if let NewtonFailure::RepeatedClamp { cell, field } = &failure {
                        let name = self.model.field_names().get(*field).copied().unwrap_or("?");
                        log::warn!("{name} of cell {cell} keeps leaving its bounds");
                    }
                    if self.controller.on_failure(step).is_err() {
                        return Err(SimulationError::NonConvergence {
                            period: self.controller.period_index(),
                            time: self.controller.time(),
                            cell: failure.cell(),
                            cause: failure,
                        });
                    }
                    retries += 1;
                }
            }
        }
    }

    /// Step until the end of the last period.
    pub fn run(&mut self) -> Result<Vec<StepReport>, SimulationError> {
        let mut reports = Vec::new();
        while !self.controller.is_finished() {
            reports.push(self.step()?);
        }
        Ok(reports)
    }

    /// Current state of every cell.
    pub fn snapshot(&self) -> impl Iterator<Item = CellSnapshot> + '_ {
        self.state.export(&self.mesh)
    }

    /// Well pressure and rates in the current state.
    pub fn well_report(&self) -> WellReport {
        let link_rates = LocalAssembler::new(&self.mesh, &self.model)
            .well_link_rates(&self.state, self.config.gravity);
        let total_rates = (0..self.model.var_count())
            .map(|e| link_rates.iter().map(|r| r[e]).sum())
            .collect();
        WellReport {
            time: self.controller.time(),
            pressure: self.state.next(self.mesh.well_id())[PRESSURE],
            link_rates,
            total_rates,
            target_link_rates: match self.controller.well_target() {
                WellTarget::Rate { link_rates } => Some(link_rates.to_vec()),
                WellTarget::Bhp { .. } => None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{BorderCondition, ConvergenceMetric, NewtonConfig, TimeStepConfig},
        controller::WellControl,
        linear::DenseLu,
        mesh::center_well_mesh,
        model::{OilModel, PhaseProperties, RockProperties, WaterOilModel, WATER_SATURATION},
        task::{square_task, StructuredMesher},
    };
    use approx::assert_relative_eq;

    fn compressible_oil() -> OilModel {
        OilModel::new(
            RockProperties {
                compressibility: 0.1,
                ..Default::default()
            },
            PhaseProperties {
                compressibility: 0.1,
                ..Default::default()
            },
        )
    }

    fn config(newton: NewtonConfig) -> SimulationConfig {
        SimulationConfig {
            newton,
            time: TimeStepConfig {
                ht_min: 0.01,
                ht_max: 0.1,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn period(end: f64, control: WellControl) -> Vec<Period> {
        vec![Period { end, control }]
    }

    /// Mass in every volume-carrying cell, counting the well once.
    fn oil_mass(sim: &Simulator<OilModel>) -> f64 {
        let mesh = sim.mesh();
        let acc = |id: usize| sim.model().accumulation(0, sim.state().next(id));
        let cells: f64 = mesh
            .inner_range()
            .filter(|&id| !mesh.cell(id).is_absorbed())
            .map(|id| mesh.cell(id).volume * acc(id))
            .sum();
        cells + mesh.well_volume() * acc(mesh.well_id())
    }

    #[test]
    fn closed_system_conserves_mass() {
        let mut sim = Simulator::new(
            center_well_mesh(),
            compressible_oil(),
            period(0.3, WellControl::Rate(0.0)),
            config(NewtonConfig::strict()),
        )
        .unwrap();
        assert_eq!(sim.config().border, BorderCondition::NoFlow);
        sim.set_initial_state(|cell| vec![1.0 + 0.2 * cell.centroid.x]);

        let initial = oil_mass(&sim);
        let reports = sim.run().unwrap();
        assert!(!reports.is_empty());
        assert_relative_eq!(sim.time(), 0.3);
        assert_relative_eq!(oil_mass(&sim), initial, max_relative = 1e-6);

        // pressure evens out without leaving the initial range
        let pressures: Vec<f64> = sim.snapshot().map(|c| c.values[0]).collect();
        assert_eq!(pressures.len(), sim.mesh().len());
        assert!(pressures.iter().all(|&p| (1.0 - 1e-6..=1.6 + 1e-6).contains(&p)));

        assert!(matches!(sim.step(), Err(SimulationError::Finished)));
    }

    /// Gravity drives flow inside a sloped domain,
    /// but nothing leaves through the closed borders.
    #[test]
    fn closed_system_with_gravity_conserves_mass() {
        let mut mesh = center_well_mesh();
        mesh.set_elevation(|p| p.x);
        let mut sim = Simulator::new(
            mesh,
            compressible_oil(),
            period(0.5, WellControl::Rate(0.0)),
            SimulationConfig {
                gravity: 1.0,
                ..config(NewtonConfig::strict())
            },
        )
        .unwrap();

        let initial = oil_mass(&sim);
        sim.run().unwrap();
        assert_relative_eq!(oil_mass(&sim), initial, max_relative = 1e-6);

        // potential p - ρgz evens out, so pressure grows with elevation
        let mesh = sim.mesh();
        let last = mesh.inner_count() - 1;
        assert!(mesh.cell(0).elevation < mesh.cell(last).elevation);
        assert!(sim.state().next(last)[0] > sim.state().next(0)[0]);
    }

    #[test]
    fn rate_controlled_well_produces() {
        let mut sim = Simulator::new(
            center_well_mesh(),
            compressible_oil(),
            period(0.5, WellControl::Rate(0.2)),
            config(NewtonConfig::strict()),
        )
        .unwrap();
        let initial = oil_mass(&sim);
        sim.run().unwrap();

        let report = sim.well_report();
        let targets = report.target_link_rates.clone().unwrap();
        assert_eq!(targets.len(), 4);
        for rate in &targets {
            assert_relative_eq!(*rate, 0.05, epsilon = 1e-12);
        }
        assert!(report.pressure < 1.0);
        assert!(report.link_rates.iter().all(|r| r[0] > 0.0));
        assert!(oil_mass(&sim) < initial);
    }

    #[test]
    fn pressure_controlled_well_produces() {
        let mut sim = Simulator::new(
            center_well_mesh(),
            compressible_oil(),
            period(0.5, WellControl::Bhp(0.5)),
            config(NewtonConfig::strict()),
        )
        .unwrap();
        let initial = oil_mass(&sim);
        sim.run().unwrap();

        let report = sim.well_report();
        assert_relative_eq!(report.pressure, 0.5, epsilon = 1e-8);
        assert_eq!(report.target_link_rates, None);
        assert_eq!(report.link_rates.len(), 4);
        assert!(report.link_rates.iter().all(|r| r[0] > 0.0));
        assert!(report.total_rates[0] > 0.0);
        assert!(oil_mass(&sim) < initial);

        let mesh = sim.mesh();
        for id in mesh.absorbed_cells() {
            assert_relative_eq!(sim.state().next(id)[0], 0.5, epsilon = 1e-8);
        }
        for id in mesh.inner_range() {
            let p = sim.state().next(id)[0];
            assert!((0.5 - 1e-5..=1.0 + 1e-5).contains(&p), "cell {id}: {p}");
        }
    }

    #[test]
    fn mean_change_metric_agrees_with_residual_metric() {
        // fixed step size so both runs take the same steps
        let run = |metric: ConvergenceMetric| {
            let mut sim = Simulator::new(
                center_well_mesh(),
                compressible_oil(),
                period(0.2, WellControl::Bhp(0.5)),
                SimulationConfig {
                    newton: NewtonConfig {
                        metric,
                        ..NewtonConfig::strict()
                    },
                    time: TimeStepConfig {
                        ht_min: 0.05,
                        ht_max: 0.05,
                        ..Default::default()
                    },
                    ..Default::default()
                },
            )
            .unwrap()
            .with_solver(DenseLu);
            sim.run().unwrap();
            sim.state().next_values().clone()
        };
        let by_residual = run(ConvergenceMetric::MaxResidual);
        let by_mean = run(ConvergenceMetric::FieldMeanChange { field: 0 });
        assert_relative_eq!(by_residual, by_mean, epsilon = 1e-5);
    }

    #[test]
    fn injected_water_raises_well_saturation() {
        let model = WaterOilModel::default();
        let initial_saturation = model.initial_water_saturation;
        let mut sim = Simulator::from_task(
            &StructuredMesher,
            &square_task(3.0, 1.0, 0.6, 0.4),
            1.0,
            model,
            period(0.2, WellControl::Rate(-0.1)),
            SimulationConfig {
                border: BorderCondition::Fixed { pressure: 1.0 },
                ..config(NewtonConfig::default())
            },
        )
        .unwrap()
        .with_solver(DenseLu);
        sim.run().unwrap();

        let well = sim.state().next(sim.mesh().well_id());
        assert!(well[WATER_SATURATION] > initial_saturation);
        assert!(well[0] > 1.0, "injection raises the well pressure");
        for cell in sim.snapshot() {
            let s = cell.values[WATER_SATURATION];
            assert!((0.0..=1.0).contains(&s));
        }
        // water leaves the well through the links
        let report = sim.well_report();
        assert!(report.total_rates[0] < 0.0);
    }

    #[test]
    fn failure_at_smallest_step_is_fatal() {
        let mut sim = Simulator::new(
            center_well_mesh(),
            compressible_oil(),
            period(1.0, WellControl::Bhp(0.5)),
            SimulationConfig {
                newton: NewtonConfig {
                    tolerance: 1e-14,
                    max_iterations: 1,
                    ..Default::default()
                },
                time: TimeStepConfig {
                    ht_min: 0.1,
                    ht_max: 0.1,
                    ..Default::default()
                },
                ..Default::default()
            },
        )
        .unwrap()
        .with_solver(DenseLu);

        let err = sim.step().unwrap_err();
        match err {
            SimulationError::NonConvergence {
                period,
                time,
                cell,
                cause,
            } => {
                assert_eq!(period, 0);
                assert_eq!(time, 0.0);
                assert!(cell.is_some());
                assert!(matches!(cause, NewtonFailure::Exhausted { iterations: 1, .. }));
            }
            other => panic!("unexpected error {other:?}"),
        }
        // nothing was committed
        assert_eq!(sim.state().next(0), &[1.0]);
    }
}
