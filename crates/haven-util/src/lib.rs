pub mod clock;
pub mod store;
pub mod token;

pub use clock::{Clock, ManualClock, SystemClock};
pub use store::{KeyStore, MemoryStore};
