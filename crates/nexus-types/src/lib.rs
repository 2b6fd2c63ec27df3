pub mod batch;
pub mod connection;
pub mod events;
pub mod session;
pub mod transfer;
pub mod user;

pub use batch::{
    BatchCounts, BatchRequest, BatchSubtask, BatchSubtaskStatus, BatchTask, BatchTaskStatus,
};
pub use connection::{AuthKind, ConnectionRecord, DecryptedCredentials, EncryptedBlob};
pub use events::{Event, EventBus};
pub use session::{ChallengePurpose, ChallengeRecord, PendingAuth, Session};
pub use transfer::{
    SourceItem, SourceItemKind, TransferMethod, TransferRequest, TransferSubtask,
    TransferSubtaskStatus, TransferTask, TransferTaskStatus,
};
pub use user::{PasskeyRecord, User};
