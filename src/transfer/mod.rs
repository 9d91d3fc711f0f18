mod engine;
mod plan;
mod progress;
mod retry;
mod source;
mod state;
mod types;
mod worker;

pub use engine::TransferEngine;
pub use plan::{plan_upload, PartRange, UploadPlan};
pub use progress::SpeedMeter;
pub use retry::{with_retry, RetryPolicy};
pub use source::{expand, guess_content_type, join_key, Payload, UploadItem, TEXT_CONTENT_TYPE};
pub use state::{TransferRegistry, UpdateRejected};
pub use types::{
    TransferFilter, TransferId, TransferPage, TransferRecord, TransferRequest, TransferSource,
    TransferStatus,
};
