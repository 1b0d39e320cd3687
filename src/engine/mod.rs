//! Connection layer
//!
//! The broker, the driver seam it talks through, and the sqlx implementation
//! of that seam.

pub mod broker;
pub mod postgres;
mod postgres_utils;
pub mod traits;

pub use broker::ConnectionBroker;
pub use postgres::PgConnector;
pub use traits::{Connector, RoleHandle};
