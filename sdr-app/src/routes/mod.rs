pub mod crm;
pub mod followups;
pub mod health;
pub mod messages;
pub mod webhook;

use axum::Router;

pub fn router() -> Router {
    Router::new()
        .merge(health::router())
        .merge(webhook::router())
        .merge(messages::router())
        .merge(followups::router())
        .merge(crm::router())
}
