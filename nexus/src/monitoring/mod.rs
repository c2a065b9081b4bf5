//! Bus metrics
//!
//! Lock-free counters updated on the hot path and read as a serializable
//! snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

pub mod metrics;

pub use metrics::*;
