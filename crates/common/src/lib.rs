/**
 * Access control markings and the deep merge used to
 *  reconcile them with permission shares.
 */
pub mod acm;
/**
 * The authorization-service interface (clearance checks,
 *  ACM flattening, snippets) and an in-memory fake used
 *  by tests and single-node deployments.
 */
pub mod auth;
/**
 * Cryptographic operations.
 *  - Per-permission file key wrapping under the master key
 *  - Permission MACs
 *  - CTR-mode content cipher with counter arithmetic for
 *    random-access range reads
 */
pub mod crypto;
/**
 * Core data model: objects, permissions, revisions,
 *  resource strings, and the request caller identity.
 */
pub mod models;
/**
 * The permission engine: consolidation, grant reduction,
 *  rollup, and reconciliation of the permission list with
 *  the ACM share.
 */
pub mod permissions;

pub mod prelude {
    pub use crate::acm::AcmDocument;
    pub use crate::auth::{AccessControl, AccessError, FakeAccessControl, Snippets};
    pub use crate::crypto::{ByteRange, ContentCipher, MasterKey};
    pub use crate::models::{
        AcmGrantee, Caller, DriveObject, ObjectId, Permission, Resource, Revision,
        TransactionType, EVERYONE_GROUP,
    };
}
