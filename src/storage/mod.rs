mod attachments;
pub mod db;
pub mod models;
mod tables;
mod usages;

pub use attachments::NewAttachment;
pub use db::{Database, DatabaseError};
pub use tables::*;
