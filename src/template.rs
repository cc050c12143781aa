//! Placeholder substitution for announcement and status formats.
//!
//! Formats come in two flavours. Rich formats use tag markup such as
//! `<gold>...</gold>` and may turn `{url}` into a clickable link. Legacy
//! formats use `&`-prefixed colour codes and receive plain values. A format
//! is treated as legacy when it contains `&` and no `<`.
//!
//! Placeholders are `{name}`. Unknown placeholders are left as written, and
//! substituted values are never scanned for further placeholders.

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Markup {
    Rich,
    Legacy,
}

impl Markup {
    #[must_use]
    pub fn detect(format: &str) -> Self {
        if format.contains('&') && !format.contains('<') {
            Self::Legacy
        } else {
            Self::Rich
        }
    }
}

/// A value for one placeholder.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Value<'a> {
    Text(&'a str),
    /// A link to `url`, shown as `label` where the markup allows it.
    Link { label: &'a str, url: &'a str },
}

impl Value<'_> {
    fn render(&self, markup: Markup, out: &mut String) {
        match (*self, markup) {
            (Value::Text(text), Markup::Rich) => escape_into(text, out),
            (Value::Text(text), Markup::Legacy) => out.push_str(text),
            (Value::Link { url, .. }, _) if url.trim().is_empty() => {}
            (Value::Link { label, url }, Markup::Rich) => {
                let label = if label.trim().is_empty() { url } else { label };
                out.push_str("<click:open_url:'");
                out.push_str(&url.replace('\'', "\\'"));
                out.push_str("'>");
                escape_into(label, out);
                out.push_str("</click>");
            }
            (Value::Link { url, .. }, Markup::Legacy) => out.push_str(url),
        }
    }
}

/// Escapes characters that rich markup would interpret.
fn escape_into(text: &str, out: &mut String) {
    for c in text.chars() {
        if matches!(c, '\\' | '<') {
            out.push('\\');
        }
        out.push(c);
    }
}

/// Substitutes `values` into `format`.
#[must_use]
pub fn render(format: &str, values: &[(&str, Value<'_>)]) -> String {
    let markup = Markup::detect(format);
    let mut out = String::with_capacity(format.len());
    let mut rest = format;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let candidate = &rest[open..];

        let replaced = candidate.find('}').and_then(|close| {
            let name = &candidate[1..close];
            values
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| (close, value))
        });

        match replaced {
            Some((close, value)) => {
                value.render(markup, &mut out);
                rest = &candidate[close + 1..];
            }
            None => {
                out.push('{');
                rest = &candidate[1..];
            }
        }
    }

    out.push_str(rest);
    out
}
