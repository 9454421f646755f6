pub mod metadata;
pub mod naming;
pub mod params;
pub mod types;
