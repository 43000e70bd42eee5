pub mod crypto;
pub mod db;
pub mod model;
pub mod users;

pub use db::{unix_now, FetchResult, Store};
pub use model::{Note, NoteDraft, NoteMeta, ValidNote, ValidationError};
pub use users::{RegisterError, UserRecord};
