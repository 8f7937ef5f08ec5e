//! Production runtime: real clock, real sleeps, thread-local randomness.

use std::time::{
    Duration,
    SystemTime,
};

use futures::future::BoxFuture;
use rand::RngCore;

use crate::Runtime;

#[derive(Clone, Default)]
pub struct ProdRuntime;

impl ProdRuntime {
    pub fn new() -> Self {
        Self
    }
}

impl Runtime for ProdRuntime {
    fn wait(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            tokio::time::sleep(duration).await;
        })
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    fn with_rng<R>(&self, f: impl FnOnce(&mut dyn RngCore) -> R) -> R {
        let mut rng = rand::rng();
        f(&mut rng)
    }
}
