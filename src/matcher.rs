use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::sync::OnceLock;

use crate::error::{MetacleanError, Result};
use crate::models::BookPatch;

/// Catalogue series designations, in priority order. The first pattern that
/// matches anywhere in the title wins.
const SERIES_PATTERNS: [&str; 4] = [
    r"\(([^)]+?),\s*#?(\d+(?:\.\d+)?)\)",
    r"\(([^)]+?)\s*#?(\d+(?:\.\d+)?)\)",
    r"\(([^)]+?),\s*Book\s*#?(\d+(?:\.\d+)?)\)",
    r"\(([^)]+?)\s*Book\s*#?(\d+(?:\.\d+)?)\)",
];

static SERIES_RES: OnceLock<Vec<Regex>> = OnceLock::new();

fn series_patterns() -> &'static [Regex] {
    SERIES_RES.get_or_init(|| {
        SERIES_PATTERNS
            .iter()
            .map(|pattern| Regex::new(pattern).expect("valid series pattern"))
            .collect()
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    /// `+`-joined, percent-encoded words for the catalogue search URL.
    pub query: String,
    pub display: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub title: String,
    pub author: String,
    pub series: Option<String>,
    pub series_index: Option<f64>,
    /// Site-relative link to the book page, as emitted by the result row.
    pub book_href: Option<String>,
    pub catalogue_id: Option<String>,
}

impl SearchResult {
    pub fn to_patch(&self) -> BookPatch {
        BookPatch {
            title: Some(self.title.clone()),
            author: Some(self.author.clone()),
            series: self.series.clone(),
            series_index: self.series_index,
            ..BookPatch::default()
        }
    }

    pub fn summary(&self) -> String {
        match (&self.series, self.series_index) {
            (Some(series), Some(index)) => {
                format!("{} by {} ({}, #{})", self.title, self.author, series, index)
            }
            (Some(series), None) => format!("{} by {} ({})", self.title, self.author, series),
            _ => format!("{} by {}", self.title, self.author),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BookPage {
    pub cover_url: String,
    pub title: Option<String>,
    pub author: Option<String>,
    pub series: Option<String>,
    pub series_index: Option<f64>,
    pub publish_info: Option<String>,
}

impl BookPage {
    pub fn to_patch(&self) -> BookPatch {
        BookPatch {
            title: self.title.clone(),
            author: self.author.clone(),
            series: self.series.clone(),
            series_index: self.series_index,
            publish_info: self.publish_info.clone(),
            scraped_cover_url: Some(self.cover_url.clone()),
            ..BookPatch::default()
        }
    }
}

/// Turns a noisy download file name into a catalogue query.
pub fn build_query(filename: &str, watermark: &str) -> SearchQuery {
    // Removing one token can expose another (`Intro.epub.epub`), so clean
    // until the display form no longer changes.
    let mut display = clean_file_name(filename, watermark);
    loop {
        let next = clean_file_name(&display, watermark);
        if next == display {
            break;
        }
        display = next;
    }

    SearchQuery {
        query: display
            .split_whitespace()
            .map(|word| urlencoding::encode(word).into_owned())
            .collect::<Vec<_>>()
            .join("+"),
        display,
    }
}

fn clean_file_name(filename: &str, watermark: &str) -> String {
    let mut text = filename.trim().to_string();
    while text.to_ascii_lowercase().ends_with(".epub") {
        text.truncate(text.len() - ".epub".len());
    }
    if !watermark.is_empty() {
        text = remove_ignore_case(&text, watermark);
    }
    let cleaned: String = text
        .chars()
        .map(|ch| match ch {
            '-' | '_' | ',' | '(' | ')' | '[' | ']' => ' ',
            other => other,
        })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn remove_ignore_case(text: &str, needle: &str) -> String {
    let lowered = text.to_ascii_lowercase();
    let needle = needle.to_ascii_lowercase();
    let mut output = String::with_capacity(text.len());
    let mut cursor = 0;
    while let Some(found) = lowered[cursor..].find(&needle) {
        let start = cursor + found;
        output.push_str(&text[cursor..start]);
        output.push(' ');
        cursor = start + needle.len();
    }
    output.push_str(&text[cursor..]);
    output
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|err| MetacleanError::parse(format!("selector {}: {}", css, err)))
}

fn element_text(element: ElementRef) -> String {
    element
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Splits a catalogue title into the bare title and its series designation.
pub fn extract_series(raw_title: &str) -> (String, Option<String>, Option<f64>) {
    for pattern in series_patterns() {
        let Some(captures) = pattern.captures(raw_title) else {
            continue;
        };
        let Some(whole) = captures.get(0) else {
            continue;
        };
        let series = captures
            .get(1)
            .map(|value| clean_series_name(value.as_str()))
            .filter(|value| !value.is_empty());
        let index = captures
            .get(2)
            .and_then(|value| value.as_str().parse::<f64>().ok());

        let mut title = String::with_capacity(raw_title.len());
        title.push_str(&raw_title[..whole.start()]);
        title.push_str(&raw_title[whole.end()..]);
        let title = title.split_whitespace().collect::<Vec<_>>().join(" ");
        return (title, series, index);
    }
    (raw_title.trim().to_string(), None, None)
}

// "(Mistborn Book 1)" is caught by the bare-number form first; drop the
// dangling "Book" so the series name stays clean.
fn clean_series_name(value: &str) -> String {
    let mut name = value.trim().trim_end_matches(',').trim_end().to_string();
    if name.to_ascii_lowercase().ends_with(" book") {
        name.truncate(name.len() - " book".len());
    }
    name.trim().trim_end_matches(',').trim().to_string()
}

/// Parses every result row on a search page.
pub fn parse_search_results(html: &str) -> Result<Vec<SearchResult>> {
    let document = Html::parse_document(html);
    let row_selector = selector("tr")?;
    let title_selector = selector(".bookTitle")?;

    let mut results = Vec::new();
    for row in document.select(&row_selector) {
        if row.select(&title_selector).next().is_none() {
            continue;
        }
        results.push(parse_row(row)?);
    }
    Ok(results)
}

/// Parses a single result row's markup.
pub fn parse_search_result(row_html: &str) -> Result<SearchResult> {
    let fragment = Html::parse_fragment(row_html);
    parse_row(fragment.root_element())
}

fn parse_row(row: ElementRef) -> Result<SearchResult> {
    let title_selector = selector(".bookTitle")?;
    let author_selector = selector(".authorName")?;

    let title_element = row
        .select(&title_selector)
        .next()
        .ok_or_else(|| MetacleanError::parse("search result has no .bookTitle"))?;
    let raw_title = element_text(title_element);
    if raw_title.is_empty() {
        return Err(MetacleanError::parse("search result title is empty"));
    }

    let authors: Vec<String> = row
        .select(&author_selector)
        .map(element_text)
        .filter(|name| !name.is_empty())
        .collect();
    if authors.is_empty() {
        return Err(MetacleanError::parse("search result has no .authorName"));
    }

    let book_href = title_element.value().attr("href").map(str::to_string);
    let catalogue_id = book_href.as_deref().and_then(catalogue_id_from_href);
    let (title, series, series_index) = extract_series(&raw_title);

    Ok(SearchResult {
        title,
        author: authors.join(", "),
        series,
        series_index,
        book_href,
        catalogue_id,
    })
}

/// `/book/show/68428.Mistborn` and `/book/show/68428-mistborn` both yield `68428`.
fn catalogue_id_from_href(href: &str) -> Option<String> {
    let path = href.split('?').next().unwrap_or(href);
    let mut parts = path.split('/').filter(|part| !part.is_empty());
    parts.find(|part| *part == "show")?;
    let slug = parts.next()?;
    let id: String = slug.chars().take_while(|ch| ch.is_ascii_digit()).collect();
    (!id.is_empty()).then_some(id)
}

/// Parses a book detail page. The cover image is required; the rest is
/// picked up when present.
pub fn parse_book_page(html: &str) -> Result<BookPage> {
    let document = Html::parse_document(html);
    let cover_selector = selector(".BookCover__image img[src]")?;
    let cover_url = document
        .select(&cover_selector)
        .next()
        .and_then(|img| img.value().attr("src"))
        .map(|src| src.trim().to_string())
        .filter(|src| !src.is_empty())
        .ok_or_else(|| MetacleanError::parse("book page has no .BookCover__image img"))?;

    let first_text = |css: &str| -> Result<Option<String>> {
        let sel = selector(css)?;
        Ok(document
            .select(&sel)
            .next()
            .map(element_text)
            .filter(|text| !text.is_empty()))
    };

    let title = first_text(".Text__title1")?;
    let author = first_text(".ContributorLink__name")?;
    let publish_info = first_text("[data-testid=\"publicationInfo\"]")?;

    // <a href=".../series/...">Mistborn<!-- --> #1</a>
    let series_selector = selector("a[href*=\"/series/\"]")?;
    let (series, series_index) = match document.select(&series_selector).next() {
        Some(link) => {
            let text = element_text(link);
            match text.rsplit_once('#') {
                Some((name, index)) => (
                    Some(name.trim().to_string()).filter(|name| !name.is_empty()),
                    index.trim().parse::<f64>().ok(),
                ),
                None => (Some(text).filter(|name| !name.is_empty()), None),
            }
        }
        None => (None, None),
    };

    Ok(BookPage {
        cover_url,
        title,
        author,
        series,
        series_index,
        publish_info,
    })
}
