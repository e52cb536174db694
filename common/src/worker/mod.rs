// Worker module: payload registry and the bounded execution pool

pub mod pool;
pub mod registry;

pub use pool::{Dispatch, ExecutionHandle, WorkerPool};
pub use registry::{JobPayload, PayloadContext, PayloadRegistry, PayloadResult};
