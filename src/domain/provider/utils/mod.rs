pub mod audit;
pub mod id;
