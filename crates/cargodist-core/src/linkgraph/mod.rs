//! The link graph pipeline: component extraction, demand estimation, flow
//! assignment and write-back.

pub mod builder;
pub mod component;
pub mod demands;
pub mod flowmapper;
pub mod job;
pub mod mcf;
pub mod path;

pub use builder::LinkGraph;
pub use component::{Edge, LinkGraphComponent, Node};
pub use demands::DemandCalculator;
pub use flowmapper::FlowMapper;
pub use job::{CancelToken, ComponentHandler, JobError, LinkGraphJob};
pub use mcf::MultiCommodityFlow;
pub use path::{Path, PathArena, PathId};
