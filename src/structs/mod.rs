pub mod parameters;
pub mod priors;
