pub mod bridge;
pub mod dispatcher;
pub mod locations;
pub mod registry;
