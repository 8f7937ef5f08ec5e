//! Runtime trait for abstracting away OS-esque features and allowing
//! different implementations for test, dev, and prod.

use std::time::{
    Duration,
    SystemTime,
    UNIX_EPOCH,
};

use futures::future::BoxFuture;
use rand::RngCore;

pub mod prod;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use prod::ProdRuntime;
#[cfg(any(test, feature = "testing"))]
pub use testing::TestRuntime;

/// A Runtime is a small operating system abstraction for this codebase. Time,
/// randomness, and sleeping behave quite differently between test and prod;
/// code that needs them is parameterized by a runtime implementation so tests
/// stay deterministic under a seed.
pub trait Runtime: Clone + Send + Sync + 'static {
    /// Sleep for the given duration.
    fn wait(&self, duration: Duration) -> BoxFuture<'static, ()>;

    /// Return (a potentially-virtualized) system time. Compare with
    /// `std::time::UNIX_EPOCH` to obtain a Unix timestamp.
    fn system_time(&self) -> SystemTime;

    /// Use the runtime's source of randomness.
    fn with_rng<R>(&self, f: impl FnOnce(&mut dyn RngCore) -> R) -> R;

    fn unix_timestamp(&self) -> Duration {
        self.system_time()
            .duration_since(UNIX_EPOCH)
            .expect("Failed to compute unix timestamp")
    }

    /// Fill a fixed-size buffer from the runtime's rng.
    fn random_bytes<const N: usize>(&self) -> [u8; N] {
        let mut bytes = [0u8; N];
        self.with_rng(|rng| rng.fill_bytes(&mut bytes));
        bytes
    }
}
