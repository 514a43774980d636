pub mod topology_cache;
