pub mod chat;
pub mod conversations;
pub mod health;
pub mod tools;

use axum::Router;

pub fn router() -> Router {
    Router::new()
        .merge(health::router())
        .merge(chat::router())
        .merge(conversations::router())
        .merge(tools::router())
}
