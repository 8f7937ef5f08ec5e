//! Test implementation of the Runtime trait: a virtual clock and a seeded
//! rng, so every test run is reproducible.

use std::{
    sync::Arc,
    time::{
        Duration,
        SystemTime,
        UNIX_EPOCH,
    },
};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use rand::{
    RngCore,
    SeedableRng,
};
use rand_chacha::ChaCha12Rng;

use crate::Runtime;

const DEFAULT_SEED: u64 = 0;

// Tests start at a fixed wall-clock time so logged timestamps are stable.
const TEST_EPOCH_SECS: u64 = 1_620_000_000;

struct TestRuntimeState {
    rng: ChaCha12Rng,
    now: SystemTime,
}

#[derive(Clone)]
pub struct TestRuntime {
    state: Arc<Mutex<TestRuntimeState>>,
}

impl TestRuntime {
    pub fn new() -> Self {
        Self::new_with_seed(DEFAULT_SEED)
    }

    pub fn new_with_seed(seed: u64) -> Self {
        cmd_util::env::config_test();
        let state = TestRuntimeState {
            rng: ChaCha12Rng::seed_from_u64(seed),
            now: UNIX_EPOCH + Duration::from_secs(TEST_EPOCH_SECS),
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn advance_time(&self, duration: Duration) {
        self.state.lock().now += duration;
    }
}

impl Default for TestRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime for TestRuntime {
    /// Waiting in tests advances the virtual clock and completes immediately.
    fn wait(&self, duration: Duration) -> BoxFuture<'static, ()> {
        self.advance_time(duration);
        Box::pin(std::future::ready(()))
    }

    fn system_time(&self) -> SystemTime {
        self.state.lock().now
    }

    fn with_rng<R>(&self, f: impl FnOnce(&mut dyn RngCore) -> R) -> R {
        let mut state = self.state.lock();
        f(&mut state.rng)
    }
}
