//! HTML overlay renderer — an external collaborator defined only by
//! interface (`render(results, title) -> html`). This module
//! gives it a trait and a default implementation so `/v1/make_html`
//! works end-to-end without a separate templating service.

use serde_json::Value;

/// Renders OCR results into an HTML overlay document.
pub trait Renderer: Send + Sync {
    /// Render one page's overlay markup. `path` is the display label
    /// supplied in the page map, `result` is the cached OCR result.
    fn page_html(&self, result: &Value, path: &str) -> String;

    /// Assemble a full document from already-rendered pages.
    fn render(&self, pages: &[String], title: &str) -> String;
}

/// Minimal overlay renderer: absolutely positioned divs over an `<img>`
/// per page, one `<section>` per page, matching mokuro's div-over-image
/// overlay shape closely enough for this contract (the cache never
/// interprets `result`, only this renderer does).
pub struct DefaultRenderer;

impl Renderer for DefaultRenderer {
    fn page_html(&self, result: &Value, path: &str) -> String {
        let width = result.get("img_width").and_then(Value::as_u64).unwrap_or(0);
        let height = result.get("img_height").and_then(Value::as_u64).unwrap_or(0);
        let blocks = result
            .get("blocks")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut overlay = String::new();
        for block in &blocks {
            let lines = block
                .get("lines")
                .and_then(Value::as_array)
                .map(|lines| {
                    lines
                        .iter()
                        .filter_map(Value::as_str)
                        .collect::<Vec<_>>()
                        .join("<br/>")
                })
                .unwrap_or_default();
            overlay.push_str(&format!(
                "<div class=\"textBox\">{}</div>",
                escape_html(&lines)
            ));
        }

        format!(
            "<section class=\"page\" data-width=\"{width}\" data-height=\"{height}\">\
             <img src=\"{path}\" alt=\"{path}\"/>\
             <div class=\"textBoxes\">{overlay}</div>\
             </section>",
            path = escape_html(path),
        )
    }

    fn render(&self, pages: &[String], title: &str) -> String {
        format!(
            "<!DOCTYPE html><html><head><title>{title}</title></head><body>{body}</body></html>",
            title = escape_html(title),
            body = pages.join("")
        )
    }
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
