// Workflow Analytics Engine
//
// Converts behavioral events into live counters, reconstructs visitor
// funnels from the raw event log, and serves the aggregated read paths.

pub mod aggregator;
pub mod funnel;
pub mod queries;

pub use aggregator::{completion_rate, CounterAggregator, NodeDelta, WorkflowDelta};
pub use funnel::{FunnelAnalytics, FunnelStep, VisitorJourney};
