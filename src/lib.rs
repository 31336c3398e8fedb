//! vanflow-collector - topology and flow correlation for an application network
//!
//! Keeps an indexed, graph-navigable view of the vanflow records reported by
//! routers, correlates transport and application biflows with that topology,
//! and derives connection, request, address, process and pair records along
//! with labeled traffic metrics.

pub mod cli;
pub mod collector;
pub mod config;
pub mod error;
pub mod flows;
pub mod graph;
pub mod identity;
pub mod managers;
pub mod metrics;
pub mod records;
pub mod store;
pub mod util;

pub use collector::{Collector, Ingest};
pub use error::{CollectorError, Result};
