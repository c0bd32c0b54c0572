//! # partita-pg
//!
//! A small synchronous PostgreSQL client speaking the v3 wire protocol,
//! and the [`PgConnectionFactory`] that plugs it into `partita-core` pools.
//!
//! Only what the record store needs is implemented: startup with
//! cleartext or SCRAM-SHA-256 authentication, simple queries for DDL, and
//! unnamed extended queries with text parameters and text results.

pub mod auth;
pub mod codec;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod store;

pub use connection::{PgConnection, Row};
pub use error::{PgError, PgResult};
pub use store::{PgConnectionFactory, PgStore};
