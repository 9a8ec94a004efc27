use scraper::{ElementRef, Html, Selector};

use crate::PageSummary;

/// Extract the page title, first `<h1>` and meta description from an HTML body.
///
/// Never fails: a missing element yields an empty string. Element text is
/// whitespace-collapsed; the description is the `content` attribute as written.
#[must_use]
pub fn analyze(body: &str) -> PageSummary {
    let document = Html::parse_document(body);

    PageSummary {
        title: first_element_text(&document, "title"),
        h1: first_element_text(&document, "h1"),
        description: meta_description(&document),
    }
}

fn first_element_text(document: &Html, css: &str) -> String {
    let Ok(selector) = Selector::parse(css) else {
        return String::new();
    };
    document.select(&selector).next().map(collapsed_text).unwrap_or_default()
}

fn meta_description(document: &Html) -> String {
    let Ok(selector) = Selector::parse("meta[name]") else {
        return String::new();
    };
    document
        .select(&selector)
        .find(|meta| {
            meta.value().attr("name").is_some_and(|name| name.eq_ignore_ascii_case("description"))
        })
        .and_then(|meta| meta.value().attr("content"))
        .map(str::to_string)
        .unwrap_or_default()
}

fn collapsed_text(element: ElementRef<'_>) -> String {
    let raw = element.text().collect::<String>();
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}
