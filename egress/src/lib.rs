#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod category;
pub mod client_egress;
pub mod config;
pub mod error;
pub mod priority_queue;
pub mod rtt;
pub mod throttle;
pub mod token_bucket;

pub use category::{Category, OutgoingPacket};
pub use client_egress::{ClientEgress, SendSink};
pub use config::{Clock, EgressConfig, Executor, InlineExecutor, ManualClock, SystemClock};
pub use error::{EgressError, EgressResult, Recoverable};
pub use priority_queue::{Item, PriorityQueue};
pub use rtt::RttEstimator;
pub use throttle::Throttles;
pub use token_bucket::{AdaptiveTokenBucket, BucketId, BucketSlab, TokenBucket};
