//! Splash templates
//!
//! One HTML template per aspect ratio. Built-ins are compiled into the
//! binary; a template directory can add or override them.

use crate::models::GenerationSpec;
use crate::Result;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

const BUILTIN: &[(&str, &str)] = &[
    ("16x9", include_str!("../data/templates/16x9.html")),
    ("4x3", include_str!("../data/templates/4x3.html")),
    ("1x1", include_str!("../data/templates/1x1.html")),
    ("9x16", include_str!("../data/templates/9x16.html")),
];

/// Replace `{{key}}` placeholders in a template string.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut result = template.to_string();
    for (key, value) in vars {
        result = result.replace(&format!("{{{{{}}}}}", key), value);
    }
    result
}

pub fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    templates: BTreeMap<String, String>,
}

impl TemplateRegistry {
    pub fn builtin() -> Self {
        Self {
            templates: BUILTIN
                .iter()
                .map(|(aspect, body)| (aspect.to_string(), body.to_string()))
                .collect(),
        }
    }

    /// Built-ins plus every `<aspect>.html` in `dir`.
    pub fn with_directory(mut self, dir: &Path) -> Result<Self> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("html") {
                continue;
            }
            if let Some(aspect) = path.file_stem().and_then(|stem| stem.to_str()) {
                let body = std::fs::read_to_string(&path)?;
                info!("Loaded template '{}' from {}", aspect, path.display());
                self.templates.insert(aspect.to_string(), body);
            }
        }
        Ok(self)
    }

    pub fn get(&self, aspect_ratio: &str) -> Option<&str> {
        self.templates.get(aspect_ratio).map(String::as_str)
    }

    pub fn aspect_ratios(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Produce the HTML document for `spec` from its resolved template.
pub fn compile(spec: &GenerationSpec) -> String {
    let thumbnails = spec
        .thumbnails
        .iter()
        .map(|url| format!(r#"<img class="thumb" src="{}" alt="">"#, escape_html(url)))
        .collect::<Vec<_>>()
        .join("\n");

    render(
        &spec.template,
        &[
            ("width", &spec.width.to_string()),
            ("height", &spec.height.to_string()),
            ("aspect_ratio", &escape_html(&spec.aspect_ratio)),
            ("experience_id", &escape_html(&spec.experience_id)),
            ("thumbnails", &thumbnails),
        ],
    )
}
