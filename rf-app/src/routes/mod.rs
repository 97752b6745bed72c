pub mod batches;
pub mod health;
pub mod messages;

use axum::Router;

pub fn router() -> Router {
    Router::new()
        .merge(health::router())
        .merge(batches::router())
        .merge(messages::router())
}
