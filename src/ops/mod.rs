pub mod action;
pub mod transfer;

pub use action::{ActionReport, ActionRunner, PostAction};
pub use transfer::{
    BatchSummary, DeleteResult, DownloadOptions, DownloadResult, FileOperator, ListOptions,
    MoveResult, UploadResult,
};
