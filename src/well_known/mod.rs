pub mod openid_configuration;

use axum::Router;
use axum::routing::get;

use crate::AppState;

pub fn well_known(state: AppState) -> Router {
    Router::new()
        .route(
            "/openid-configuration",
            get(openid_configuration::handler),
        )
        .with_state(state)
}
