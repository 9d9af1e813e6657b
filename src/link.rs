//! CoRE link-format rendering for `.well-known/core`.

use std::fmt::Write;

/// One link attribute value; rendered as `key`, `key=value` or
/// `key="value"` depending on the variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAttrValue {
    Flag,
    Quoted(String),
    Uint(u32),
}

/// A single `</path>;attr;attr=...` entry.
#[derive(Debug, Clone, Default)]
pub struct CoreLink {
    path: String,
    attributes: Vec<(&'static str, LinkAttrValue)>,
}

impl CoreLink {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            attributes: Vec::new(),
        }
    }

    pub fn attr(&mut self, key: &'static str, value: LinkAttrValue) {
        self.attributes.push((key, value));
    }

    pub fn format_single_link(&self) -> String {
        let mut out = String::new();
        // writing into a String cannot fail
        write!(out, "<{}>", self.path).unwrap();
        for (key, value) in &self.attributes {
            match value {
                LinkAttrValue::Flag => write!(out, ";{key}").unwrap(),
                LinkAttrValue::Quoted(v) => write!(out, ";{key}=\"{v}\"").unwrap(),
                LinkAttrValue::Uint(v) => write!(out, ";{key}={v}").unwrap(),
            }
        }
        out
    }
}

/// Renders preformatted link entries, comma separated, into `buf`.
/// Returns the number of bytes written, or `None` when the rendering
/// does not fit — the caller drops the response in that case.
pub fn render_links<'a>(
    links: impl IntoIterator<Item = &'a str>,
    buf: &mut [u8],
) -> Option<usize> {
    let mut written = 0;
    for (i, link) in links.into_iter().enumerate() {
        let need = link.len() + usize::from(i > 0);
        if buf.len() - written < need {
            return None;
        }
        if i > 0 {
            buf[written] = b',';
            written += 1;
        }
        buf[written..written + link.len()].copy_from_slice(link.as_bytes());
        written += link.len();
    }
    Some(written)
}
