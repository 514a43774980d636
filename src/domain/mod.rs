pub mod clock;
pub mod provider;
