//! Background execution of the link graph pipeline.
//!
//! A job takes exclusive ownership of its component: the snapshot moves into
//! the worker thread at spawn and comes back through [`LinkGraphJob::join`],
//! so neither side can touch it while the other holds it. Handlers poll the
//! cancel token between iterations; a worker panic is caught at the top of
//! the pipeline and surfaces as [`JobError::Failed`], which the main thread
//! treats exactly like a cancelled job.

use crate::id::{CargoId, ComponentColour, Date, StationId};
use crate::linkgraph::component::LinkGraphComponent;
use crate::linkgraph::demands::DemandCalculator;
use crate::linkgraph::flowmapper::FlowMapper;
use crate::linkgraph::mcf::MultiCommodityFlow;
use crate::settings::DistributionType;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;

/// One stage of the pipeline a job runs over its component.
pub trait ComponentHandler: Send {
    fn run(&mut self, component: &mut LinkGraphComponent, cancel: &CancelToken);
}

/// Cooperative cancellation flag shared between the main thread and a
/// worker. Handlers poll it between iterations and bail at the next safe
/// point; no partial results are merged afterwards.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum JobError {
    #[error("link graph job was cancelled")]
    Cancelled,
    #[error("link graph worker failed")]
    Failed,
}

type JobResult = Result<Box<LinkGraphComponent>, JobError>;

/// The component and its handler pipeline, handed to whoever runs them.
type JobPayload = (Box<LinkGraphComponent>, Vec<Box<dyn ComponentHandler>>);

/// What actually runs on the worker thread.
type WorkerBody = dyn FnOnce() -> JobResult + Send;

enum JobState {
    /// Built but not yet started.
    Pending {
        component: Box<LinkGraphComponent>,
        handlers: Vec<Box<dyn ComponentHandler>>,
    },
    /// Running on a worker thread.
    Running(JoinHandle<JobResult>),
    /// Ran inline because no worker thread could be created.
    Finished(JobResult),
    /// Joined; nothing left.
    Drained,
}

/// A spawned (or spawnable) run of the pipeline over one component.
pub struct LinkGraphJob {
    cargo: CargoId,
    colour: ComponentColour,
    join_date: Date,
    cancel: CancelToken,
    /// Link capacities frozen at spawn, released at join. Kept on the main
    /// thread so a failed worker still lets the links thaw.
    frozen_links: Vec<(StationId, StationId, u32)>,
    state: JobState,
}

impl LinkGraphJob {
    /// Wraps a component with the handler pipeline its settings call for.
    pub fn new(
        component: LinkGraphComponent,
        join_date: Date,
        frozen_links: Vec<(StationId, StationId, u32)>,
    ) -> Self {
        let distribution = component.settings().distribution_for(component.cargo());
        debug_assert_ne!(
            distribution,
            DistributionType::Manual,
            "manual cargo never gets a job"
        );
        let handlers: Vec<Box<dyn ComponentHandler>> = vec![
            Box::new(DemandCalculator::new(distribution)),
            Box::new(MultiCommodityFlow),
            Box::new(FlowMapper),
        ];
        Self {
            cargo: component.cargo(),
            colour: component.colour(),
            join_date,
            cancel: CancelToken::new(),
            frozen_links,
            state: JobState::Pending {
                component: Box::new(component),
                handlers,
            },
        }
    }

    pub fn cargo(&self) -> CargoId {
        self.cargo
    }

    pub fn colour(&self) -> ComponentColour {
        self.colour
    }

    pub fn join_date(&self) -> Date {
        self.join_date
    }

    pub fn frozen_links(&self) -> &[(StationId, StationId, u32)] {
        &self.frozen_links
    }

    /// Requests cancellation; the worker exits at its next poll.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Hands the component to a worker thread. When thread creation fails
    /// the pipeline runs inline on the caller before returning.
    ///
    /// The worker closure captures only a channel end; the payload is sent
    /// over once the thread exists, so a failed spawn leaves it with the
    /// caller for the inline run.
    pub fn spawn(&mut self) {
        self.spawn_with(|name, body| std::thread::Builder::new().name(name).spawn(body));
    }

    /// `spawn_thread` abstracts thread creation so the no-thread fallback
    /// can be exercised; production passes `std::thread::Builder` through.
    fn spawn_with<S>(&mut self, spawn_thread: S)
    where
        S: FnOnce(String, Box<WorkerBody>) -> std::io::Result<JoinHandle<JobResult>>,
    {
        match std::mem::replace(&mut self.state, JobState::Drained) {
            JobState::Pending { component, handlers } => {
                let (sender, receiver) = mpsc::channel::<JobPayload>();
                let worker_cancel = self.cancel.clone();
                let body: Box<WorkerBody> = Box::new(move || match receiver.recv() {
                    Ok((component, handlers)) => execute(component, handlers, worker_cancel),
                    Err(_) => Err(JobError::Failed),
                });
                match spawn_thread(format!("linkgraph-c{}", self.cargo.0), body) {
                    Ok(handle) => match sender.send((component, handlers)) {
                        Ok(()) => self.state = JobState::Running(handle),
                        Err(mpsc::SendError((component, handlers))) => {
                            // The worker died before taking the job; run it
                            // here instead of losing it.
                            self.state = JobState::Finished(execute(
                                component,
                                handlers,
                                self.cancel.clone(),
                            ));
                        }
                    },
                    Err(err) => {
                        tracing::warn!(
                            target: "linkgraph::job",
                            cargo = self.cargo.0,
                            error = %err,
                            "worker thread unavailable, running job inline"
                        );
                        self.state = JobState::Finished(execute(
                            component,
                            handlers,
                            self.cancel.clone(),
                        ));
                    }
                }
            }
            other => {
                debug_assert!(false, "spawn on a job that already ran");
                self.state = other;
            }
        }
    }

    /// Blocks until the pipeline is done and takes the component back.
    pub fn join(&mut self) -> Result<Box<LinkGraphComponent>, JobError> {
        match std::mem::replace(&mut self.state, JobState::Drained) {
            JobState::Pending { component, handlers } => {
                // Never spawned; run it now so a join always has a result.
                execute(component, handlers, self.cancel.clone())
            }
            JobState::Running(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(JobError::Failed),
            },
            JobState::Finished(result) => result,
            JobState::Drained => Err(JobError::Cancelled),
        }
    }
}

impl std::fmt::Debug for LinkGraphJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkGraphJob")
            .field("cargo", &self.cargo)
            .field("colour", &self.colour)
            .field("join_date", &self.join_date)
            .finish_non_exhaustive()
    }
}

/// The worker body. Panics inside a handler must not cross the thread
/// boundary; they are converted into a failed job here.
fn execute(
    mut component: Box<LinkGraphComponent>,
    mut handlers: Vec<Box<dyn ComponentHandler>>,
    cancel: CancelToken,
) -> Result<Box<LinkGraphComponent>, JobError> {
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        for handler in handlers.iter_mut() {
            if cancel.is_cancelled() {
                return Err(JobError::Cancelled);
            }
            handler.run(&mut component, &cancel);
        }
        Ok(())
    }));
    match outcome {
        Ok(Ok(())) if cancel.is_cancelled() => Err(JobError::Cancelled),
        Ok(Ok(())) => Ok(component),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(JobError::Failed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{Map, NodeIndex};
    use crate::settings::LinkGraphSettings;
    use slotmap::SlotMap;

    fn two_node_component() -> LinkGraphComponent {
        let map = Map::new(32, 32);
        let mut stations = SlotMap::<StationId, ()>::with_key();
        let settings = LinkGraphSettings {
            distribution_default: DistributionType::Asymmetric,
            ..LinkGraphSettings::default()
        };
        let mut component = LinkGraphComponent::new(
            CargoId(4),
            ComponentColour(1),
            settings,
            map.max_link_distance(),
        );
        let a = component.add_node(stations.insert(()), map.tile(0, 0), 10, 0);
        let b = component.add_node(stations.insert(()), map.tile(8, 0), 0, 10);
        component.init_edges();
        component.add_edge(a, b, 10);
        component.calculate_distances(&map);
        component
    }

    #[test]
    fn spawned_job_returns_its_component() {
        let mut job = LinkGraphJob::new(two_node_component(), 5, Vec::new());
        job.spawn();
        let component = job.join().expect("job should succeed");
        assert_eq!(component.size(), 2);
        // The pipeline ran: flow was assigned on the only edge.
        assert!(component.edge(NodeIndex(0), NodeIndex(1)).flow > 0);
    }

    #[test]
    fn cancelled_job_reports_cancellation() {
        let mut job = LinkGraphJob::new(two_node_component(), 5, Vec::new());
        job.cancel();
        job.spawn();
        assert_eq!(job.join().unwrap_err(), JobError::Cancelled);
    }

    #[test]
    fn panicking_handler_marks_the_job_failed() {
        struct Explodes;
        impl ComponentHandler for Explodes {
            fn run(&mut self, _: &mut LinkGraphComponent, _: &CancelToken) {
                panic!("boom");
            }
        }

        let component = two_node_component();
        let result = execute(
            Box::new(component),
            vec![Box::new(Explodes)],
            CancelToken::new(),
        );
        assert_eq!(result.unwrap_err(), JobError::Failed);
    }

    #[test]
    fn join_without_spawn_runs_inline() {
        let mut job = LinkGraphJob::new(two_node_component(), 5, Vec::new());
        let component = job.join().expect("inline run should succeed");
        assert!(component.edge(NodeIndex(0), NodeIndex(1)).flow > 0);
    }

    #[test]
    fn failed_thread_spawn_falls_back_to_inline() {
        let mut job = LinkGraphJob::new(two_node_component(), 5, Vec::new());
        job.spawn_with(|_name, _body| {
            Err(std::io::Error::other("worker threads unavailable"))
        });
        // The pipeline already ran on this thread; join just hands the
        // finished component back.
        let component = job.join().expect("inline fallback should succeed");
        assert!(component.edge(NodeIndex(0), NodeIndex(1)).flow > 0);
    }

    #[test]
    fn failed_spawn_of_cancelled_job_reports_cancellation() {
        let mut job = LinkGraphJob::new(two_node_component(), 5, Vec::new());
        job.cancel();
        job.spawn_with(|_name, _body| {
            Err(std::io::Error::other("worker threads unavailable"))
        });
        assert_eq!(job.join().unwrap_err(), JobError::Cancelled);
    }
}
