mod admin;
mod tokens;
mod users;

pub use admin::{delete_secret, rotate_secret, set_state, status};
pub use tokens::{issue_token, verify_token};
pub use users::{authenticate_user, create_user, delete_user, get_user, update_user};
