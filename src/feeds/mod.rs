//! Exchange feeds - Raw user-data messages into canonical events

pub mod events;
pub mod normalizer;

pub use events::{EventKind, FillDetails, NormalizedEvent, OrderDetails};
pub use normalizer::{EventNormalizer, NormalizerCounts};
