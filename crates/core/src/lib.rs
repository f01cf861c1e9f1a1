//! Domain layer shared by the storage and HTTP crates.
//!
//! Everything here is pure: pricing, permission rules, pagination maths,
//! input validation and the proposal status machine carry no I/O so they can
//! be unit tested without a database.

pub mod pagination;
pub mod permissions;
pub mod pricing;
pub mod status;
pub mod types;
pub mod validation;

pub use pagination::{Page, PageRequest, Pagination, SortConfig, SortDirection};
pub use permissions::{Actor, GroupScope, Permission, PermissionSet};
pub use pricing::{PriceSummary, PricingContext, PricingError};
pub use status::{ProposalStatus, TransitionError};
pub use validation::{ValidationError, Validator};
