//! Partita prelude: import everything you need with one line.
//!
//! ```rust,ignore
//! use partita_core::prelude::*;
//! ```

// ── Access layer ───────────────────────────────────────────────
pub use crate::Config;
pub use crate::DataAccess;
pub use crate::PartitionRegistry;
pub use crate::{PdalError, PdalResult};

// ── Data model ─────────────────────────────────────────────────
pub use crate::{Key, PartitionId, Record, Role};

// ── Store seam ─────────────────────────────────────────────────
pub use crate::{ConnectionFactory, Endpoint, StoreConnection, StoreError};

// ── Logging ────────────────────────────────────────────────────
pub use crate::logging::{init_logging, init_logging_json, init_logging_pretty};
