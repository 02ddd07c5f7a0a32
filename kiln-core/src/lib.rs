pub mod cache;
pub mod device;
pub mod error;
pub mod generation;
pub mod idle;
pub mod layout;
pub mod pipeline;
pub mod registry;
pub mod request;
pub mod sdxl;
pub mod service;
pub mod status;
pub mod util;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cache::*;
pub use device::{query_accelerator, select_best_device, AcceleratorInfo, DeviceMap};
pub use error::*;
pub use idle::{spawn_watchdog, ActivityClock, IdlePolicy};
pub use layout::*;
pub use pipeline::*;
pub use registry::*;
pub use request::*;
pub use sdxl::SdxlLoader;
pub use service::Service;
