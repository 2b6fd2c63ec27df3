pub mod batch;
pub mod dialer;
pub mod shell;
pub mod store;
pub mod transfer;

pub use batch::{BatchError, BatchExecutor};
pub use dialer::{DialError, Dialer, ExecEvent, ExecStream, RemoteSession};
pub use store::{HasId, MemoryTaskStore, SqliteBatchStore, StoreError, TaskStore};
pub use transfer::{TransferError, TransferOrchestrator};
