pub mod composer;
pub mod contract;
pub mod executor;
pub mod router;
