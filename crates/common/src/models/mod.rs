pub mod caller;
pub mod object;
pub mod permission;
pub mod resource;
pub mod revision;

pub use caller::{Caller, CallerError, TransactionType};
pub use object::{new_change_token, DeletedObjectView, DriveObject, ObjectId, ObjectIdError};
pub use permission::{AcmGrantee, Permission};
pub use resource::{flatten, Resource, ResourceError, EVERYONE_GROUP};
pub use revision::Revision;
