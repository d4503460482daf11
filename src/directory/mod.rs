//! The directory: the authoritative record of structure.
//!
//! Namespaces, objects, versions, ACLs, metadata, and upload jobs live
//! in a relational store; bulk bytes live in a storage backend. The
//! [`sqlite::SqliteDirectory`] is the shipped implementation.

pub mod records;
pub mod sqlite;
