use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Form, State};
use axum::response::Html;
use axum::routing::{get, post};
use axum::Router;
use diagen_engine::extract::DEFAULT_DIAGRAM_CODE;
use diagen_engine::notices::{NoticeLevel, Notices};
use diagen_engine::{DiagramEngine, ReviewRequest};
use serde::Deserialize;

pub const DEFAULT_DESCRIPTION: &str =
    "Generate diagram code for a web service with ELB, EC2, and RDS using the diagrams library.";

#[derive(Clone)]
pub struct AppState {
    engine: Arc<DiagramEngine>,
}

impl AppState {
    pub fn new(engine: Arc<DiagramEngine>) -> Self {
        Self { engine }
    }
}

/// Fields posted back by the form. The current code travels with every
/// request, so the server keeps no per-session state.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FormInput {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub code: String,
}

#[derive(Debug, Default)]
struct PageView {
    description: String,
    model: String,
    code: String,
    notices: Notices,
    image_data_url: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/review", post(review))
        .route("/generate", post(generate))
        .with_state(state)
}

pub async fn serve(state: AppState, listen: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    println!("Serving diagram form on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .await
        .context("form server stopped")
}

pub async fn index(State(state): State<AppState>) -> Html<String> {
    let view = PageView {
        description: DEFAULT_DESCRIPTION.to_string(),
        code: DEFAULT_DIAGRAM_CODE.to_string(),
        ..PageView::default()
    };
    Html(render_page(&state, &view))
}

/// "Review Diagram Code".
pub async fn review(State(state): State<AppState>, Form(input): Form<FormInput>) -> Html<String> {
    let engine = state.engine.clone();
    let request = ReviewRequest {
        prompt: input.description.clone(),
        model_id: Some(input.model.clone()).filter(|model| !model.trim().is_empty()),
    };
    let mut view = PageView {
        description: input.description,
        model: input.model,
        code: current_code(input.code),
        ..PageView::default()
    };
    match tokio::task::spawn_blocking(move || engine.review(&request)).await {
        Ok(outcome) => {
            if let Some(code) = outcome.code {
                view.code = code;
            }
            if let Some(model) = outcome.model {
                view.model = model.id;
            }
            view.notices = outcome.notices;
        }
        Err(err) => view.notices.error(format!("Review task failed: {err}")),
    }
    Html(render_page(&state, &view))
}

/// "Generate Diagram".
pub async fn generate(State(state): State<AppState>, Form(input): Form<FormInput>) -> Html<String> {
    let engine = state.engine.clone();
    let code = current_code(input.code);
    let submitted = code.clone();
    let mut view = PageView {
        description: input.description,
        model: input.model,
        code,
        ..PageView::default()
    };
    match tokio::task::spawn_blocking(move || engine.generate(&submitted)).await {
        Ok(outcome) => {
            view.image_data_url = outcome.image().map(|image| image.data_url());
            view.notices = outcome.notices;
        }
        Err(err) => view.notices.error(format!("Render task failed: {err}")),
    }
    Html(render_page(&state, &view))
}

fn current_code(posted: String) -> String {
    if posted.trim().is_empty() {
        DEFAULT_DIAGRAM_CODE.to_string()
    } else {
        posted.replace("\r\n", "\n")
    }
}

fn render_page(state: &AppState, view: &PageView) -> String {
    let models = state.engine.models();
    let selected = models
        .iter()
        .find(|model| model.id == view.model)
        .or_else(|| models.first())
        .map(|model| model.id.clone())
        .unwrap_or_default();
    let options: String = models
        .iter()
        .map(|model| {
            format!(
                r#"<option value="{}"{}>{}</option>"#,
                escape_html(&model.id),
                if model.id == selected { " selected" } else { "" },
                escape_html(&model.label)
            )
        })
        .collect();

    let notices: String = view
        .notices
        .iter()
        .map(|notice| match notice.level {
            NoticeLevel::Text => format!(
                r#"<pre class="output">{}</pre>"#,
                escape_html(&notice.text)
            ),
            level => format!(
                r#"<div class="notice {}">{}</div>"#,
                level.as_str(),
                escape_html(&notice.text).replace('\n', "<br>")
            ),
        })
        .collect();

    let image = view
        .image_data_url
        .as_ref()
        .map(|url| {
            format!(
                r#"<figure><img src="{url}" alt="Generated Diagram"><figcaption>Generated Diagram</figcaption></figure>"#
            )
        })
        .unwrap_or_default();

    let code = escape_html(&view.code);
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <title>Diagram Generator</title>
    <style>
        body {{ font-family: sans-serif; margin: 0; display: grid; grid-template-columns: 280px 1fr; }}
        aside {{ background: #f3f4f6; padding: 1.5rem; min-height: 100vh; }}
        main {{ padding: 1.5rem 2rem; max-width: 960px; }}
        label {{ display: block; margin: 1rem 0 0.4rem; font-weight: 600; }}
        input[type="text"], select, textarea {{ width: 100%; box-sizing: border-box; }}
        textarea {{ font-family: monospace; min-height: 18rem; }}
        .actions {{ margin-top: 1rem; display: flex; gap: 0.75rem; }}
        .notice {{ padding: 0.6rem 0.8rem; margin: 0.5rem 0; border-radius: 4px; }}
        .notice.error {{ background: #fee2e2; }}
        .notice.success {{ background: #dcfce7; }}
        .notice.info {{ background: #dbeafe; }}
        pre {{ background: #111827; color: #f9fafb; padding: 0.8rem; overflow-x: auto; }}
        img {{ max-width: 100%; }}
    </style>
</head>
<body>
<aside>
    <h2>Prerequisites</h2>
    <p>Graphviz must be installed and <code>dot</code> must be on your PATH.</p>
    <ul>
        <li>macOS: <code>brew install graphviz</code></li>
        <li>Debian/Ubuntu: <code>sudo apt-get install graphviz</code></li>
        <li>Windows: <code>choco install graphviz</code></li>
    </ul>
    <p>The <code>diagrams</code> Python package must be importable: <code>pip install diagrams</code></p>
</aside>
<main>
    <h1>Diagram Generator</h1>
    <form method="post">
        <label for="description">Describe the diagram you want</label>
        <input type="text" id="description" name="description" value="{description}">
        <label for="model">Model</label>
        <select id="model" name="model">{options}</select>
        <label for="code">Diagram code</label>
        <textarea id="code" name="code">{code}</textarea>
        <div class="actions">
            <button type="submit" formaction="/review">Review Diagram Code</button>
            <button type="submit" formaction="/generate">Generate Diagram</button>
        </div>
    </form>
    <section class="notices">{notices}</section>
    <h3>Current code</h3>
    <pre><code class="language-python">{code}</code></pre>
    {image}
</main>
</body>
</html>
"#,
        description = escape_html(&view.description),
    )
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}
