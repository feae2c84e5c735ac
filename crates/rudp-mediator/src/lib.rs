//! NAT punch-through mediator library: the pure state machine and its
//! supporting rate limiter, split out from the binary's async I/O loop
//! so both `main.rs` and the integration tests in `tests/` can drive
//! [`mediator::Mediator`] directly.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod mediator;
pub mod rate_limit;
