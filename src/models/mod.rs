pub mod assignment;
pub mod driver;
pub mod location;
pub mod order;
