mod attach;
mod containers;
mod health;

pub use attach::{prepare_attach, stream_attach};
pub use containers::{
    create_container, delete_container, get_container, list_containers, start_container,
};
pub use health::{handler_404, health};
