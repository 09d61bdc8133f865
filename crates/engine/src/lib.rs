//! Mimir engine: case registry, evidence store, command dispatch and the history ledger

pub mod archive;
pub mod case_registry;
pub mod commands;
pub mod config;
pub mod dispatcher;
pub mod evidence;
pub mod integrations;
pub mod ledger;

pub use archive::CaseArchive;
pub use case_registry::{CasePolicy, CaseRegistry, CaseSnapshot, CaseState, CaseStorage};
pub use commands::{
    ArgSpec, ArgType, Capability, CommandDescriptor, CommandHandler, CommandOutput,
    CommandRegistry, HandlerContext,
};
pub use config::MimirConfig;
pub use dispatcher::{DispatchRequest, DispatchResult, DispatchState, Dispatcher};
pub use evidence::{BlobStore, EvidenceStore, EvidenceTxn, FsBlobStore, MemoryBlobStore, VerifyReport};
pub use integrations::{IntegrationAdapter, IntegrationError, IntegrationHub};
pub use ledger::{ExportFormat, Ledger, LedgerSink, MemorySink, Replay};

pub use mimir_core;
