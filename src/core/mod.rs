//! Runtime components of the publisher application.

pub mod readiness;
pub mod relay;
