#![forbid(unsafe_code)]

pub use plover_macro::service;

mod error;
pub use error::{Error, ErrorKind, Result};

mod payload;
pub use payload::Payload;

pub mod codec;
pub use codec::CodecType;

pub mod hash_ring;

mod context;
pub use context::Context;

mod router;
pub use router::{Method, Router, Service};

mod waiter;
pub use waiter::{Delivery, Waiter, WaiterCleaner};

mod task_supervisor;
pub use task_supervisor::{TaskSupervisor, TaskSupervisorGuard};

mod receiver;
pub use receiver::Receiver;

mod state;
pub use state::State;

mod listener;
pub use listener::Listener;

mod client;
pub use client::{Client, ClientConfig};

mod server;
pub use server::{Server, ServerConfig};

mod xclient;
pub use xclient::{SelectMode, XClient, XClientConfig};

pub mod registry;
pub use registry::Registry;
