pub mod emitter;
pub mod event;

pub use emitter::{read_audit_log, AuditEmitter, AuditError, BoundedSinkQueue, AUDIT_LOG_FILE};
pub use event::{AuditDraft, AuditEventKind, AuditRecord};
