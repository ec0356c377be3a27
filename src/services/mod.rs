pub mod approvals;
pub mod authz;
pub mod datasources;
pub mod errors;
pub mod queries;
pub mod transactions;
