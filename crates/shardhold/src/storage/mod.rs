pub mod file_journal;
pub mod memory_journal;
pub mod memory_membership;

#[cfg(feature = "sql")]
pub mod sql_journal;
