use crate::{routes::page, server::SharedState};
use axum::{extract::State, response::Html};

pub async fn index(State(state): State<SharedState>) -> Html<String> {
    Html(page::index_page(state.session.config().default_confidence))
}
