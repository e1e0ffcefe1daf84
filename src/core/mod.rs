//! Core proxy mechanics: admission primitives and the splice.

pub mod limiter;
pub mod relay;
pub mod schedule;
pub mod subnet;

pub use limiter::SourceLimiter;
pub use relay::{relay, RelayOutcome, RelayResult};
pub use schedule::{Schedule, ScheduleDenial};
pub use subnet::{classify, subnets_contain, IpClass};
