//! Data Transfer Objects for REST request/response serialization.

pub mod common_dto;
pub mod rover_dto;

pub use common_dto::*;
pub use rover_dto::*;
