use crate::error::Result;
use crate::parser::epub::EpubContainer;

/// Removes the watermark from every text page and saves the container when
/// anything changed. Returns the number of pages rewritten.
pub fn strip_watermark(container: &mut dyn EpubContainer, watermark: &str) -> Result<usize> {
    if watermark.is_empty() {
        return Ok(0);
    }

    let mut changed = 0;
    for page in container.text_pages() {
        let markup = container.read_page(&page)?;
        if !markup.contains(watermark) {
            continue;
        }
        container.write_page(&page, &markup.replace(watermark, ""))?;
        changed += 1;
    }

    if changed > 0 {
        container.save()?;
        log::info!(
            "removed watermark from {} page(s) of {}",
            changed,
            container.path().display()
        );
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::epub::fixtures::{tiny_png, write_epub, FixtureBook};
    use crate::parser::epub::EpubBook;

    #[test]
    fn strips_every_page() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book.epub");
        let mut book = FixtureBook::new("Mistborn", "Brandon Sanderson");
        book.pages = vec![
            ("ch1", "<p>OceanofPDF.com</p><p>Text</p>".to_string()),
            ("ch2", "<p>Clean</p>".to_string()),
            ("ch3", "<p>More OceanofPDF.com text OceanofPDF.com</p>".to_string()),
        ];
        write_epub(&path, &book);

        let mut epub = EpubBook::open(&path).unwrap();
        assert_eq!(strip_watermark(&mut epub, "OceanofPDF.com").unwrap(), 2);

        let reopened = EpubBook::open(&path).unwrap();
        for page in reopened.text_pages() {
            assert!(!reopened.read_page(&page).unwrap().contains("OceanofPDF.com"));
        }
        assert_eq!(reopened.read_page("ch1").unwrap(), "<p></p><p>Text</p>");
    }

    #[test]
    fn cleaning_twice_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book.epub");
        let mut book = FixtureBook::new("Mistborn", "Brandon Sanderson");
        book.pages = vec![("ch1", "<p>OceanofPDF.com</p>".to_string())];
        book.cover = Some(tiny_png());
        write_epub(&path, &book);

        strip_watermark(&mut EpubBook::open(&path).unwrap(), "OceanofPDF.com").unwrap();
        let once = std::fs::read(&path).unwrap();
        let changed = strip_watermark(&mut EpubBook::open(&path).unwrap(), "OceanofPDF.com").unwrap();
        assert_eq!(changed, 0);
        assert_eq!(std::fs::read(&path).unwrap(), once);
    }
}
