pub mod audit;
pub mod page;

pub use audit::{
    Audit, AuditId, AuditSnapshot, AuditStatus, ResultTarget, StageKind, StageOutput, StageRecord,
    StageStatus,
};
pub use page::{AuditPage, Headings, ImageRecord, LinkRecord, PageData};
