pub mod case;
pub mod error;
pub mod evidence;
pub mod history;
pub mod path_safety;

pub use case::{generate_case_id, validate_case_id, Case, CaseStatus};
pub use error::{ErrorCode, ErrorReport, MimirError, Result};
pub use evidence::{compute_sha256, is_sha256_hex, CustodyAction, CustodyEntry, Evidence, ParentLink};
pub use history::{ArgList, ArgValue, HistoryEntry, Outcome, PendingEntry, Scope};
pub use path_safety::{safe_join, validate_path_component, PathValidationError};
