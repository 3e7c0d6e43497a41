mod admin;
mod attachments;
mod images;

use crate::api::response::ApiError;
use crate::manager::AttachmentError;
use crate::storage::DatabaseError;
use crate::token::TokenError;
use crate::validation::ValidationError;

pub use admin::{admin_cleanup, admin_invalidate_image_cache, admin_purge, health};
pub use attachments::{
    add_usage, create_attachment, create_attachment_from_url, delete_attachment,
    download_by_token, get_attachment, obtain_attachment_url, remove_usage, serve_public,
};
pub use images::serve_image;

/// Map an AttachmentError to an ApiError
fn attachment_error(e: AttachmentError) -> ApiError {
    match e {
        AttachmentError::Validation(ValidationError::SizeExceeded { size, limit }) => {
            ApiError::payload_too_large(format!("File size {size} exceeds limit of {limit} bytes"))
        }
        AttachmentError::Validation(e) => ApiError::bad_request(e.to_string()),
        AttachmentError::InvalidGroup(group) => {
            ApiError::bad_request(format!("Invalid group name: '{group}'"))
        }
        AttachmentError::Database(DatabaseError::Conflict(msg)) => ApiError::conflict(msg),
        AttachmentError::Fetch(e) => {
            ApiError::bad_request(format!("Failed to fetch remote file: {e}"))
        }
        _ => ApiError::internal(e.to_string()),
    }
}

fn token_error(e: TokenError) -> ApiError {
    ApiError::internal(e.to_string())
}
