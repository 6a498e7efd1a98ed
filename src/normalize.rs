//! Rewrites extracted article fragments so they survive outside their original page.
//!
//! Every `<img>` reference (`src`, `srcset`, lazy-load attributes) and every `<a href>` is resolved
//! against the page URL. References that cannot be resolved are left exactly as written.

use std::cell::RefCell;
use std::collections::HashSet;

use html_escape::{decode_html_entities, encode_double_quoted_attribute};
use lol_html::html_content::Element;
use lol_html::{RewriteStrSettings, doc_text, element, rewrite_str};
use url::Url;

/// Attributes lazy-loading scripts use to hold the real image URL.
pub const LAZY_IMAGE_ATTRIBUTES: &[&str] =
    &["data-src", "data-original", "data-lazy-src", "data-image"];

pub fn normalize(html: &str, base_url: &str) -> String {
    let Ok(base) = Url::parse(base_url) else {
        tracing::debug!(base = %base_url, "base url does not parse; leaving html untouched");
        return html.to_owned();
    };

    let result = rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![
                element!("img", |el| {
                    let had_src = el.has_attribute("src");
                    if let Some(src) = attribute_value(el, "src")
                        && let Some(resolved) = resolve_reference(&base, &src)
                    {
                        el.set_attribute("src", &encode_attribute(&resolved))?;
                    }
                    if let Some(srcset) = attribute_value(el, "srcset") {
                        let resolved = resolve_srcset(&base, &srcset);
                        el.set_attribute("srcset", &encode_attribute(&resolved))?;
                    }

                    let mut promoted: Option<String> = None;
                    for attr in LAZY_IMAGE_ATTRIBUTES {
                        let Some(value) = attribute_value(el, attr) else {
                            continue;
                        };
                        let Some(resolved) = resolve_reference(&base, &value) else {
                            continue;
                        };
                        el.set_attribute(attr, &encode_attribute(&resolved))?;
                        if promoted.is_none() {
                            promoted = Some(resolved);
                        }
                    }
                    if !had_src && let Some(src) = promoted {
                        el.set_attribute("src", &encode_attribute(&src))?;
                    }
                    Ok(())
                }),
                element!("a[href]", |el| {
                    if let Some(href) = attribute_value(el, "href")
                        && let Some(resolved) = resolve_reference(&base, &href)
                    {
                        el.set_attribute("href", &encode_attribute(&resolved))?;
                    }
                    Ok(())
                }),
            ],
            ..RewriteStrSettings::new()
        },
    );

    match result {
        Ok(out) => out,
        Err(err) => {
            tracing::warn!(base = %base_url, ?err, "html rewrite failed; leaving html untouched");
            html.to_owned()
        }
    }
}

/// Absolute image URLs referenced by `html`, with `data:` URIs and unparseable values dropped.
/// Entity references in attribute values are decoded, so the URLs are the ones to request.
pub fn collect_image_urls(html: &str, base_url: &str) -> HashSet<String> {
    let Ok(base) = Url::parse(base_url) else {
        return HashSet::new();
    };

    let candidates = RefCell::new(Vec::<String>::new());
    let result = rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![element!("img", |el| {
                let mut found = candidates.borrow_mut();
                if let Some(src) = attribute_value(el, "src") {
                    found.push(src);
                }
                if let Some(srcset) = attribute_value(el, "srcset") {
                    found.extend(
                        split_srcset(&srcset)
                            .into_iter()
                            .map(|(url, _)| url.to_owned()),
                    );
                }
                for attr in LAZY_IMAGE_ATTRIBUTES {
                    if let Some(value) = attribute_value(el, attr) {
                        found.push(value);
                    }
                }
                Ok(())
            })],
            ..RewriteStrSettings::new()
        },
    );
    if let Err(err) = result {
        tracing::warn!(base = %base_url, ?err, "image scan failed");
        return HashSet::new();
    }

    candidates
        .into_inner()
        .into_iter()
        .filter(|candidate| !is_data_uri(candidate))
        .filter_map(|candidate| resolve_reference(&base, &candidate))
        .collect()
}

/// Text content of an HTML fragment with entities decoded and whitespace collapsed.
pub fn plain_text(html: &str) -> String {
    let text = RefCell::new(String::with_capacity(html.len() / 2));
    let result = rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![element!("*", |_el| {
                text.borrow_mut().push(' ');
                Ok(())
            })],
            document_content_handlers: vec![doc_text!(|chunk| {
                text.borrow_mut().push_str(chunk.as_str());
                Ok(())
            })],
            ..RewriteStrSettings::new()
        },
    );
    if let Err(err) = result {
        tracing::debug!(?err, "text scan failed");
    }

    let raw = text.into_inner();
    decode_html_entities(&raw)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Attribute value with entity references decoded. `lol_html` hands back the source text.
pub(crate) fn attribute_value(el: &Element<'_, '_>, name: &str) -> Option<String> {
    el.get_attribute(name)
        .map(|raw| decode_html_entities(&raw).into_owned())
}

fn encode_attribute(value: &str) -> String {
    encode_double_quoted_attribute(value).into_owned()
}

fn resolve_reference(base: &Url, reference: &str) -> Option<String> {
    let trimmed = reference.trim();
    if trimmed.is_empty() || is_data_uri(trimmed) {
        return None;
    }

    match Url::parse(trimmed) {
        Ok(absolute) => Some(absolute.to_string()),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            // A relative-path reference cannot carry a colon in its first segment (RFC 3986 4.2).
            let first_segment = trimmed.split(['/', '?', '#']).next().unwrap_or_default();
            if first_segment.contains(':') {
                return None;
            }
            base.join(trimmed).ok().map(|url| url.to_string())
        }
        Err(_) => None,
    }
}

fn resolve_srcset(base: &Url, srcset: &str) -> String {
    split_srcset(srcset)
        .into_iter()
        .map(|(url, descriptor)| {
            let url = resolve_reference(base, url).unwrap_or_else(|| url.to_owned());
            match descriptor {
                Some(descriptor) => format!("{url} {descriptor}"),
                None => url,
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn split_srcset(srcset: &str) -> Vec<(&str, Option<&str>)> {
    srcset
        .split(',')
        .map(str::trim)
        .filter(|candidate| !candidate.is_empty())
        .filter_map(|candidate| {
            let mut parts = candidate.split_whitespace();
            let url = parts.next()?;
            let descriptor = parts.next();
            Some((url, descriptor))
        })
        .collect()
}

fn is_data_uri(value: &str) -> bool {
    value
        .trim_start()
        .get(..5)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("data:"))
}
