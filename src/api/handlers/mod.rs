mod auth;
mod health;
mod storage;
mod sync;

pub use auth::{
    admin_create_user, login, refresh, rotate_storage_credentials, storage_credentials,
};
pub use health::health;
pub use storage::{delete_object, get_object, head_object, list_objects, put_object};
pub use sync::{
    create_vault, delete_vault, get_vault_key, list_vaults, pull_changes, push_changes,
    rename_vault,
};
