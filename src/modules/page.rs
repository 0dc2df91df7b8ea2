use axum::response::Html;

const ABOUT_PAGE: &str = include_str!("../../templates/about.html");

/// Handle GET /about
///
/// Serves the bundled static page. No state is read or written.
pub async fn handle_about() -> Html<&'static str> {
    Html(ABOUT_PAGE)
}

#[tokio::test]
async fn test_about_page_is_html() {
    let Html(body) = handle_about().await;
    assert!(body.trim_start().starts_with("<!DOCTYPE html>"));
    assert!(body.contains("</html>"));
}
