//! Outbound webhook delivery: signing, HTTP transport, retry scheduling and
//! the executor that ties them to the circuit breaker and the delivery store.

pub mod client;
pub mod executor;
pub mod retry;
pub mod signing;
