use crate::{
    pipeline::RunSummary,
    session::{SessionError, ALLOWED_EXTENSIONS, MAX_CONFIDENCE, MIN_CONFIDENCE, OUTPUT_FILE_NAME},
};
use axum::{
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};
use uuid::Uuid;

const APP_TITLE: &str = "YOLO Vehicle Detection App";
const CONFIDENCE_STEP: f32 = 0.05;

const STYLE: &str = r#"
body { margin: 0; font-family: sans-serif; display: flex; min-height: 100vh; color: #262730; }
aside { width: 18rem; padding: 1.5rem; background: #f0f2f6; }
main { flex: 1; padding: 2rem 3rem; }
video { max-width: 100%; }
.error { color: #b00020; }
.button { display: inline-block; margin-top: 1rem; padding: 0.5rem 1rem; border: 1px solid #ccc; border-radius: 0.4rem; text-decoration: none; color: inherit; }
"#;

pub fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

fn layout(sidebar: &str, content: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>{title}</title>
<style>{style}</style>
</head>
<body>
<aside>{sidebar}</aside>
<main>
<h1>{title}</h1>
{content}
</main>
</body>
</html>"#,
        title = APP_TITLE,
        style = STYLE,
        sidebar = sidebar,
        content = content,
    )
}

pub fn index_page(default_confidence: f32) -> String {
    let accept = ALLOWED_EXTENSIONS
        .iter()
        .map(|ext| format!(".{}", ext))
        .collect::<Vec<_>>()
        .join(",");

    let sidebar = format!(
        r#"<h2>Settings</h2>
<label for="confidence">Confidence Threshold</label>
<input type="range" id="confidence" name="confidence" form="upload"
       min="{min:.2}" max="{max:.2}" step="{step:.2}" value="{value:.2}"
       oninput="document.getElementById('confidence-value').textContent = Number(this.value).toFixed(2)">
<span id="confidence-value">{value:.2}</span>"#,
        min = MIN_CONFIDENCE,
        max = MAX_CONFIDENCE,
        step = CONFIDENCE_STEP,
        value = default_confidence,
    );

    let content = format!(
        r#"<form id="upload" action="/process" method="post" enctype="multipart/form-data">
<label for="video">Upload a video</label>
<input type="file" id="video" name="video" accept="{accept}" required>
<button type="submit">Process Video</button>
</form>"#,
        accept = accept,
    );

    layout(&sidebar, &content)
}

pub fn result_page(id: Uuid, summary: &RunSummary) -> String {
    let content = format!(
        r#"<p>Processing complete.</p>
<p>{frames} frames at {width}x{height}, {fps:.2} fps. {boxes} boxes drawn on {annotated} frames.</p>
<video controls src="/runs/{id}/video"></video>
<p><a class="button" href="/runs/{id}/download" download="{file_name}">Download Processed Video</a></p>
<p><a href="/">Process another video</a></p>"#,
        frames = summary.frames_written,
        width = summary.width,
        height = summary.height,
        fps = summary.fps,
        boxes = summary.boxes_drawn,
        annotated = summary.frames_annotated,
        id = id,
        file_name = OUTPUT_FILE_NAME,
    );

    layout("<h2>Settings</h2>", &content)
}

pub fn error_page(status: StatusCode, message: &str) -> String {
    let content = format!(
        r#"<p class="error"><strong>{status}</strong></p>
<p class="error">{message}</p>
<p><a href="/">Back</a></p>"#,
        status = status,
        message = escape(message),
    );

    layout("<h2>Settings</h2>", &content)
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        (status, Html(error_page(status, &self.to_string()))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape() {
        assert_eq!(
            escape(r#"<script>"x" & 'y'</script>"#),
            "&lt;script&gt;&quot;x&quot; &amp; &#39;y&#39;&lt;/script&gt;"
        );
    }

    #[test]
    fn test_index_page_controls() {
        let page = index_page(0.5);

        assert!(page.contains("<title>YOLO Vehicle Detection App</title>"));
        assert!(page.contains("<h2>Settings</h2>"));
        assert!(page.contains(r#"min="0.10" max="1.00" step="0.05" value="0.50""#));
        assert!(page.contains(r#"accept=".mp4,.avi,.mov""#));
    }

    #[test]
    fn test_error_page_escapes_message() {
        let page = error_page(StatusCode::BAD_REQUEST, "bad <file>.mkv");

        assert!(page.contains("400 Bad Request"));
        assert!(page.contains("bad &lt;file&gt;.mkv"));
    }
}
