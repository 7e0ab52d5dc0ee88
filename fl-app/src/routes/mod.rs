pub mod events;
pub mod health;
pub mod messages;
pub mod sessions;

use axum::Router;

pub fn router() -> Router {
    Router::new()
        .merge(health::router())
        .merge(events::router())
        .merge(messages::router())
        .merge(sessions::router())
}
