//! Coordination core of a distributed CI/CD build master: agent registry,
//! circuit breaker, durable build queue, dispatch decision, and the
//! background loops (queue processor, orphan monitor, leader election) that
//! tie them together.

pub mod breaker;
pub mod dispatch;
pub mod leader;
pub mod locality;
pub mod orphan;
pub mod processor;
pub mod queue;
pub mod registry;
pub mod strategy;
pub mod transport;
