//! # pmothrottle
//!
//! Limits how many deliveries an identity (a user, an API key, a feed) may run
//! at the same time. Each identity gets a counting semaphore, created on first
//! use with the capacity given by a [`CapacitySource`]; capacities can be
//! changed at runtime and idle identities are swept to bound memory.
//!
//! ```no_run
//! use std::time::Duration;
//! use pmothrottle::{AdmissionThrottle, ThrottleSettings};
//!
//! # async fn demo() -> Result<(), pmothrottle::ThrottleError> {
//! let throttle = AdmissionThrottle::new(ThrottleSettings::new(Some(2)));
//! let permit = throttle.acquire("alice", Duration::from_secs(5)).await?;
//! // ... serve the request ...
//! permit.release();
//! # Ok(())
//! # }
//! ```

mod error;
mod settings;
mod throttle;

pub use error::ThrottleError;
pub use settings::{CapacitySource, ThrottleSettings};
pub use throttle::{AdmissionPermit, AdmissionThrottle};
