//! Schema design and per-project database provisioning.
//!
//! The designer asks the LLM for a relational schema; the provisioner
//! creates the project's database on the cluster and applies the DDL
//! transactionally. This is the single provisioning path in the worker.

pub mod designer;
pub mod provisioner;

pub use designer::{design_schema, DesignedColumn, DesignedSchema, DesignedTable};
pub use provisioner::{provision_database, DatabaseInfo};
