pub mod backend_type;
pub mod nrm_backend_trait;
pub mod null_backend;
pub mod static_topology_backend;
