pub mod credential_handlers;
pub mod health_handlers;
pub mod preview_handlers;
pub mod upload_form;
pub mod verify_handlers;
