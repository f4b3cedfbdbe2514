pub mod batch_service;
pub mod error;
pub mod unpack_service;
