use plover::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Args {
    pub num1: i64,
    pub num2: i64,
    /// Seconds the handler sleeps before answering.
    #[serde(default)]
    pub handle_time: f32,
}

#[plover::service]
pub trait Foo {
    async fn double(&self, c: &Context, r: &i64) -> Result<i64>;

    /// Adds both numbers after sleeping `handle_time` seconds.
    async fn sum(&self, c: &Context, r: &Args) -> Result<i64>;
}

#[derive(Default)]
pub struct FooImpl {
    served: AtomicU64,
}

impl FooImpl {
    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Acquire)
    }
}

impl Foo for FooImpl {
    async fn double(&self, _c: &Context, r: &i64) -> Result<i64> {
        self.served.fetch_add(1, Ordering::AcqRel);
        Ok(r * 2)
    }

    async fn sum(&self, _c: &Context, r: &Args) -> Result<i64> {
        self.served.fetch_add(1, Ordering::AcqRel);
        if r.handle_time > 0.0 {
            tokio::time::sleep(Duration::from_secs_f32(r.handle_time)).await;
        }
        Ok(r.num1 + r.num2)
    }
}
