//! Offline queue of local mutations awaiting delivery

pub mod ports;
pub mod service;

pub use ports::OperationRepository;
pub use service::OfflineQueue;
