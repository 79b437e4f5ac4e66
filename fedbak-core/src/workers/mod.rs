//! Background workers: replica placement, change propagation and
//! health sampling. Each runs on its own timer and skips a tick when
//! the previous run is still active.

pub mod health;
pub mod placement;
pub mod propagation;
pub mod queue;

#[cfg(test)]
pub(crate) mod test_support;
