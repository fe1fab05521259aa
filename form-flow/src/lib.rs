pub mod catalog;
pub mod engine;
pub mod error;
pub mod event;
pub mod fields;
pub mod files;
pub mod forms;
pub mod machine;
pub mod notify;
pub mod phase;
pub mod postgres;
pub mod records;
pub mod render;
pub mod retry;
pub mod schema;
pub mod session;
pub mod validators;

// Re-export commonly used types
pub use catalog::{CatalogOption, CatalogProvider, InMemoryCatalog};
pub use engine::{
    CANCEL_COMMAND, Collaborators, DialogEngine, DialogStatus, EngineConfig, EngineResult,
    StartMode,
};
pub use error::{FormError, Result};
pub use event::{Choice, Event, EventKind, FileSource, FileUpload, OwnerId, Prompt};
pub use fields::Fields;
pub use files::{FileIntake, FileRef, LocalFileIntake};
pub use machine::FileCarryOver;
pub use notify::{InMemoryOutbox, NotificationSink};
pub use phase::{Answer, ChoiceSource, InputKind, PhaseDef, Target, Transition};
pub use postgres::{PostgresRecordStore, PostgresSessionStore};
pub use records::{
    CommitOutcome, DraftRecord, InMemoryRecordStore, Record, RecordCommitter, RecordStore,
};
pub use retry::RetryPolicy;
pub use schema::{FormSchema, FormSchemaBuilder, GroupDef, SchemaRegistry};
pub use session::{InMemorySessionStore, Session, SessionStore};
